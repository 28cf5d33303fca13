//! Rendering of job scripts.

use crate::spec::JobSpec;
use anyhow::{Context, Result};
use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;
use te_types::config::{shell_quote, ClusterConfig, ModuleConfig};

const MIB: u64 = 1024 * 1024;

/// Memory request in whole megabytes, rounded up.
pub fn memory_mb(bytes: u64) -> u64 {
    bytes.div_ceil(MIB)
}

/// Render the bash script for `job`. With `directives`, the script starts with
/// the `#SBATCH` lines derived from `cluster` and the job's resource request.
pub fn render_script(
    job: &JobSpec,
    cluster: &ClusterConfig,
    modules: &ModuleConfig,
    directives: bool,
) -> String {
    let mut s = String::from("#!/usr/bin/env bash\n");
    if directives {
        let mut d = |line: String| {
            // writing to a String cannot fail
            let _ = writeln!(s, "#SBATCH {line}");
        };
        d(format!("--partition={}", cluster.queue_name));
        if let Some(endpoint) = &cluster.scheduler_endpoint {
            d(format!("--clusters={endpoint}"));
        }
        d(format!("--time={}", cluster.default_walltime));
        if let Some(account) = &cluster.accounting_project {
            d(format!("--account={account}"));
        }
        if job.required_memory_bytes > 0 {
            d(format!("--mem={}M", memory_mb(job.required_memory_bytes)));
        }
        d(format!("--cpus-per-task={}", job.cores.max(1)));
        d(format!("--job-name={}", job.name));
        let log = job.working_dir.join(format!("_{}.%j", job.name));
        d(format!("--output={}.out", log.display()));
        d(format!("--error={}.err", log.display()));
        for extra in &cluster.extra_directives {
            d(extra.clone());
        }
    }
    s.push_str("set -euo pipefail\n");
    for line in modules.setup_lines(&job.tools) {
        s.push_str(&line);
        s.push('\n');
    }
    let _ = writeln!(s, "cd {}", shell_quote(&job.working_dir.display().to_string()));
    s.push_str(job.command.trim_end());
    s.push('\n');
    s
}

/// Create the job's working directory and write its script there.
pub fn write_script(
    job: &JobSpec,
    cluster: &ClusterConfig,
    modules: &ModuleConfig,
    directives: bool,
) -> Result<PathBuf> {
    fs::create_dir_all(&job.working_dir)
        .with_context(|| job.working_dir.display().to_string())?;
    let path = job.script_path();
    fs::write(&path, render_script(job, cluster, modules, directives))
        .with_context(|| path.display().to_string())?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use te_types::config::{EnvModType, EnvironmentMod, Tool};

    fn job() -> JobSpec {
        JobSpec::new("quant_AA_ASAP101", "cellranger count --id=AA_ASAP101", "/scratch/quant")
            .with_tools([Tool::CellRanger])
            .with_resources(64 * 1024 * MIB, 10)
    }

    #[test]
    fn test_slurm_script() {
        let mut cluster = ClusterConfig::new("lu48");
        cluster.accounting_project = Some("lsens2018-3-3".to_string());
        cluster.extra_directives = vec!["--exclusive".to_string()];
        let mut modules = ModuleConfig::default();
        modules
            .tools
            .insert(Tool::CellRanger, vec!["cellranger/7.0.0".to_string()]);
        modules.env.push(EnvironmentMod {
            key: "PATH".to_string(),
            value: "/opt/tepipe/bin".to_string(),
            mod_type: EnvModType::Prepend,
        });

        insta::assert_snapshot!(render_script(&job(), &cluster, &modules, true), @r###"
        #!/usr/bin/env bash
        #SBATCH --partition=lu48
        #SBATCH --time=7-00:00:00
        #SBATCH --account=lsens2018-3-3
        #SBATCH --mem=65536M
        #SBATCH --cpus-per-task=10
        #SBATCH --job-name=quant_AA_ASAP101
        #SBATCH --output=/scratch/quant/_quant_AA_ASAP101.%j.out
        #SBATCH --error=/scratch/quant/_quant_AA_ASAP101.%j.err
        #SBATCH --exclusive
        set -euo pipefail
        module purge
        module load cellranger/7.0.0
        export PATH=/opt/tepipe/bin${PATH:+:$PATH}
        cd /scratch/quant
        cellranger count --id=AA_ASAP101
        "###);
    }

    #[test]
    fn test_local_script_has_no_directives() {
        let script = render_script(
            &job(),
            &ClusterConfig::new("lu48"),
            &ModuleConfig::default(),
            false,
        );
        assert_eq!(
            script,
            "#!/usr/bin/env bash\nset -euo pipefail\ncd /scratch/quant\ncellranger count --id=AA_ASAP101\n"
        );
        assert_eq!(memory_mb(1), 1);
        assert_eq!(memory_mb(0), 0);
    }
}
