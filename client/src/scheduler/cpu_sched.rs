//! Debt-based proportional-share CPU scheduling.
//!
//! A project's debt is the CPU time it is owed: it grows by its share of all
//! CPU time handed out and shrinks by what its own results consumed. Each
//! pass hands the CPUs to the projects with the largest anticipated debt.

use std::cell::RefCell;
use std::cmp::{Ordering, Reverse};
use std::rc::Rc;
use std::time::Instant;

use log::{debug, info};
use priority_queue::PriorityQueue;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::common::{FloatWrapper, ProjectId, ResultId, Time};
use crate::state::stats::ClientStats;

/// Transient per-project scheduling state; never persisted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectPeriod {
    pub anticipated_debt: f64,
    // between passes: CPU time actually reported; inside a pass: quanta handed out
    pub work_done_this_period: f64,
    pub next_runnable_result: Option<ResultId>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PeriodState {
    pub projects: FxHashMap<ProjectId, ProjectPeriod>,
    pub total_work_done: f64,
}

impl PeriodState {
    pub fn record_work(&mut self, project_id: ProjectId, cpu_time: f64) {
        self.projects
            .entry(project_id)
            .or_default()
            .work_done_this_period += cpu_time;
        self.total_work_done += cpu_time;
    }

    pub fn work_done(&self, project_id: ProjectId) -> f64 {
        self.projects
            .get(&project_id)
            .map(|p| p.work_done_this_period)
            .unwrap_or(0.)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchedResult {
    pub id: ResultId,
    pub name: String,
    pub report_deadline: Time,
}

/// Snapshot of one project as seen by a scheduling pass.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedProject {
    pub id: ProjectId,
    pub master_url: String,
    pub resource_share: f64,
    pub debt: f64,
    pub non_cpu_intensive: bool,
    pub runnable: Vec<SchedResult>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PassOutcome {
    // in the order the CPUs were handed out
    pub selected: Vec<ResultId>,
    // new debt of every project that had runnable work
    pub debts: Vec<(ProjectId, f64)>,
    pub period: PeriodState,
}

fn result_cmp(a: &SchedResult, b: &SchedResult, now: Time) -> Ordering {
    let missed = |r: &SchedResult| r.report_deadline > 0. && now > r.report_deadline;
    missed(a)
        .cmp(&missed(b))
        .then_with(|| FloatWrapper(a.report_deadline).cmp(&FloatWrapper(b.report_deadline)))
        .then_with(|| a.name.cmp(&b.name))
}

/// One scheduling pass. Pure: reads the snapshot and the period state, and
/// returns the selection together with the updated debts and period state.
pub fn schedule_pass(
    projects: &[SchedProject],
    period: &PeriodState,
    ncpus: u32,
    quantum: f64,
    now: Time,
) -> PassOutcome {
    let active: Vec<&SchedProject> = projects
        .iter()
        .filter(|p| !p.non_cpu_intensive && !p.runnable.is_empty())
        .collect();
    let total_share: f64 = active.iter().map(|p| p.resource_share).sum();

    let mut next_period = PeriodState::default();
    let mut debts = Vec::new();
    let mut queues: FxHashMap<ProjectId, Vec<&SchedResult>> = FxHashMap::default();
    // already_selected
    let mut selected_set: FxHashSet<ResultId> = FxHashSet::default();
    let mut selected = Vec::new();

    // credit each project with its share of the CPU time used last period
    for p in &active {
        let share_frac = p.resource_share / total_share;
        let debt = p.debt + share_frac * period.total_work_done;
        debts.push((p.id, debt));
        next_period.projects.insert(
            p.id,
            ProjectPeriod {
                anticipated_debt: debt,
                work_done_this_period: 0.,
                next_runnable_result: None,
            },
        );
        let mut queue: Vec<&SchedResult> = p.runnable.iter().collect();
        queue.sort_by(|a, b| result_cmp(a, b, now));
        queues.insert(p.id, queue);
    }

    // non CPU intensive work always runs and takes no CPU slot
    for p in projects.iter().filter(|p| p.non_cpu_intensive) {
        for r in &p.runnable {
            if selected_set.insert(r.id) {
                selected.push(r.id);
            }
        }
    }

    for _ in 0..ncpus {
        let mut candidates = PriorityQueue::new();
        for p in &active {
            let has_work = queues[&p.id].iter().any(|r| !selected_set.contains(&r.id));
            if !has_work {
                continue;
            }
            let share_frac = p.resource_share / total_share;
            let pp = next_period.projects.entry(p.id).or_default();
            pp.anticipated_debt += share_frac * quantum;
            candidates.push(
                p.id,
                (
                    FloatWrapper(pp.anticipated_debt - pp.work_done_this_period),
                    FloatWrapper(p.resource_share),
                    Reverse(p.master_url.clone()),
                ),
            );
        }
        let Some((best, _)) = candidates.pop() else {
            break;
        };
        let result_id = queues[&best]
            .iter()
            .map(|r| r.id)
            .find(|id| !selected_set.contains(id));
        let Some(result_id) = result_id else {
            break;
        };
        assert!(
            selected_set.insert(result_id),
            "result {} selected twice in one pass",
            result_id
        );
        selected.push(result_id);
        let pp = next_period.projects.entry(best).or_default();
        pp.work_done_this_period += quantum;
        pp.next_runnable_result = Some(result_id);
        debug!(
            "cpu slot -> project {} result {} (anticipated debt {:.1})",
            best, result_id, pp.anticipated_debt
        );
    }

    // actual CPU time of the new period is reported later
    for pp in next_period.projects.values_mut() {
        pp.work_done_this_period = 0.;
    }

    PassOutcome {
        selected,
        debts,
        period: next_period,
    }
}

pub struct CpuScheduler {
    pub period: PeriodState,
    ncpus: u32,
    quantum: f64,
    stats: Rc<RefCell<ClientStats>>,
}

impl CpuScheduler {
    pub fn new(ncpus: u32, quantum: f64, stats: Rc<RefCell<ClientStats>>) -> Self {
        Self {
            period: PeriodState::default(),
            ncpus,
            quantum,
            stats,
        }
    }

    pub fn ncpus(&self) -> u32 {
        self.ncpus
    }

    pub fn record_work(&mut self, project_id: ProjectId, cpu_time: f64) {
        self.period.record_work(project_id, cpu_time);
    }

    pub fn run(&mut self, projects: &[SchedProject], ncpus: u32, now: Time) -> PassOutcome {
        let t = Instant::now();
        info!("scheduling started");

        let outcome = schedule_pass(projects, &self.period, ncpus, self.quantum, now);
        self.period = outcome.period.clone();

        info!(
            "scheduling finished. projects {} selected {}",
            projects.len(),
            outcome.selected.len()
        );
        let duration = t.elapsed().as_secs_f64();
        self.stats.borrow_mut().scheduler_sum_dur += duration;
        self.stats.borrow_mut().scheduler_samples += 1;
        outcome
    }
}
