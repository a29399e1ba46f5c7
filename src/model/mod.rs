pub mod work_item;
pub mod workflow_run;
