pub mod cpu_sched;
pub mod work_fetch;
