use std::cmp::Ordering;

pub type ProjectId = u64;
pub type AppId = u64;
pub type AppVersionId = u64;
pub type WorkunitId = u64;
pub type ResultId = u64;
pub type FileId = u64;

// Wall-clock seconds; 0 means "unset" wherever a time acts as a gate
pub type Time = f64;

// Float wrapper for ordered structs
#[derive(Debug, Clone, Copy)]
pub struct FloatWrapper(pub f64);

impl PartialEq for FloatWrapper {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for FloatWrapper {}

impl PartialOrd for FloatWrapper {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FloatWrapper {
    fn cmp(&self, other: &Self) -> Ordering {
        // Handle NaN as the largest value
        if self.0.is_nan() && other.0.is_nan() {
            Ordering::Equal
        } else if self.0.is_nan() {
            Ordering::Greater
        } else if other.0.is_nan() {
            Ordering::Less
        } else {
            self.0.partial_cmp(&other.0).unwrap_or(Ordering::Equal)
        }
    }
}
