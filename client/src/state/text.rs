//! Length checks for names and URLs.
//!
//! Oversized text is rejected, never truncated.

use crate::error::{ClientError, Result};

pub fn check_text(field: &'static str, value: &str, max: usize) -> Result<()> {
    if value.len() > max {
        return Err(ClientError::TextTooLong {
            field,
            len: value.len(),
            max,
        });
    }
    Ok(())
}

pub fn check_all<'a, I>(field: &'static str, values: I, max: usize) -> Result<()>
where
    I: IntoIterator<Item = &'a str>,
{
    for value in values {
        check_text(field, value, max)?;
    }
    Ok(())
}
