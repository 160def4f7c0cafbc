//! Print the MiniCluster each job would get, without touching any cluster

use anyhow::Result;
use std::path::Path;

use crate::burst::job::{JobFile, JobSource};
use crate::config::minicluster;
use crate::config::settings::Settings;

pub fn render(settings: &Settings, jobs_file: &Path) -> Result<()> {
    let params = super::load_params(settings)?;
    let jobs = JobFile::new(jobs_file).pending_jobs()?;

    for (i, job) in jobs.iter().enumerate() {
        let spec = minicluster::build(job, &params, &params.lead);
        if i > 0 {
            println!("---");
        }
        print!("{}", minicluster::to_yaml(&spec)?);
    }
    Ok(())
}
