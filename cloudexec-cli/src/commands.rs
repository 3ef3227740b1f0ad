//! Subcommand handlers
//!
//! Every handler that touches DigitalOcean goes through `App`, which wires the
//! bucket client, state store, registry and orchestrator once per invocation.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use cx_core::{Identity, Settings};
use cx_object_store::{ObjectStoreClient, RetryPolicy, SpacesBackend, SpacesCredentials};
use cx_orchestrator::{
    CancelOutcome, ComputeProvider, DigitalOceanProvider, JobLogs, LaunchRequest, OpenSshShell,
    Orchestrator,
};
use cx_state_store::{unix_now, JobRegistry, JobStatus, StateStore};
use tracing::{info, warn};

use crate::launch_config::{self, LaunchConfig, LAUNCH_CONFIG_FILE};
use crate::status;
use crate::user_data;

/// Values accepted by `cloudexec configure`; unset fields keep their current value
#[derive(Debug, Default)]
pub struct ConfigureArgs {
    pub username: Option<String>,
    pub api_key: Option<String>,
    pub spaces_access_key: Option<String>,
    pub spaces_secret_key: Option<String>,
    pub spaces_region: Option<String>,
}

/// Everything a DigitalOcean-facing command needs
pub struct App {
    settings: Settings,
    spaces: Arc<SpacesBackend>,
    compute: Arc<DigitalOceanProvider>,
    orchestrator: Orchestrator,
}

impl App {
    pub fn new(settings: Settings) -> Result<Self> {
        settings.require_credentials()?;

        let identity = Identity::new(settings.username.clone());
        let digitalocean = &settings.digitalocean;
        let credentials = SpacesCredentials {
            access_key: digitalocean.spaces_access_key.clone(),
            secret_key: digitalocean.spaces_secret_key.clone(),
            region: digitalocean.spaces_region.clone(),
        };
        let spaces = Arc::new(SpacesBackend::new(&credentials, identity.bucket_name()));

        let retry = RetryPolicy::new(
            settings.state.retry_attempts,
            Duration::from_millis(settings.state.retry_step_ms),
        );
        let client = Arc::new(ObjectStoreClient::new(spaces.clone()).with_retry(retry));
        let store = StateStore::new(client)
            .with_consistency(settings.state.consistency)
            .with_write_retry(retry);

        let compute = Arc::new(DigitalOceanProvider::new(digitalocean.api_key.clone()));
        let shell = Arc::new(OpenSshShell::from_home()?);
        let orchestrator = Orchestrator::new(JobRegistry::new(store), identity, compute.clone(), shell);

        info!(
            bucket = %orchestrator.identity().bucket_name(),
            consistency = %settings.state.consistency,
            "Client ready"
        );
        Ok(Self {
            settings,
            spaces,
            compute,
            orchestrator,
        })
    }

    fn registry(&self) -> &JobRegistry {
        self.orchestrator.registry()
    }

    /// `job`, or the most recently created job
    async fn job_or_latest(&self, job: Option<i64>) -> Result<i64> {
        if let Some(id) = job {
            return Ok(id);
        }
        match self.registry().latest_job().await? {
            Some(job) => Ok(job.id),
            None => bail!("No jobs found"),
        }
    }

    pub async fn check(&self) -> Result<()> {
        let account = self
            .compute
            .check_auth()
            .await
            .context("Failed to authenticate with DigitalOcean API")?;
        println!("Successfully authenticated with DigitalOcean API as {}", account);

        let buckets = self
            .spaces
            .list_buckets()
            .await
            .context("Failed to authenticate with DigitalOcean Spaces API")?;
        println!(
            "Successfully authenticated with DigitalOcean Spaces API ({} buckets visible)",
            buckets.len()
        );

        let image = self.compute.boot_image().await?;
        println!("Using image {}", image);
        Ok(())
    }

    pub async fn launch(
        &self,
        config_path: &Path,
        size: &str,
        region: Option<&str>,
        name: Option<&str>,
    ) -> Result<()> {
        let launch = LaunchConfig::load(config_path)?;
        launch_config::validate(&launch)?;
        let user_data = user_data::generate(&self.settings, &launch)?;

        let client = self.registry().store().client();
        client.ensure_container().await?;
        self.registry().store().initialize().await?;

        let region = region.unwrap_or(self.settings.digitalocean.spaces_region.as_str());
        let request = LaunchRequest {
            name: name.unwrap_or_default().to_string(),
            input_dir: launch.input_dir(config_path),
            region: region.to_string(),
            size: size.to_string(),
            user_data,
        };

        println!("Launching a {} droplet in {}...", size, region);
        let job = self.orchestrator.launch(&request).await?;
        let ip = job.droplet.as_ref().map(|h| h.ip.as_str()).unwrap_or_default();

        println!("Launch complete: job {} on {}", job.id, ip);
        println!("You can now attach to the running job with: cloudexec attach");
        println!("Stream logs from the droplet with: cloudexec logs");
        println!("SSH to your droplet with: ssh {}", cx_orchestrator::host_alias(job.id));
        Ok(())
    }

    pub async fn status(&self, show_all: bool) -> Result<()> {
        let state = self.registry().state().await?;
        let jobs = status::select_jobs(&state, show_all);
        print!("{}", status::render(&jobs, unix_now()));

        match self.orchestrator.orphaned_instances().await {
            Ok(orphans) => {
                for orphan in orphans {
                    println!(
                        "Warning: droplet {} ({}, {}) is not referenced by any job",
                        orphan.name, orphan.id, orphan.ip
                    );
                }
            }
            Err(e) => warn!(error = %e, "Could not check for orphaned droplets"),
        }
        Ok(())
    }

    pub async fn logs(&self, job: Option<i64>) -> Result<()> {
        let id = self.job_or_latest(job).await?;
        match self.orchestrator.job_logs(id).await? {
            JobLogs::Streamed => {}
            JobLogs::Stored(bytes) => {
                let mut stdout = std::io::stdout().lock();
                stdout.write_all(&bytes)?;
                stdout.flush()?;
            }
        }
        Ok(())
    }

    pub async fn attach(&self, job: Option<i64>) -> Result<()> {
        let id = self.job_or_latest(job).await?;
        self.orchestrator.attach(id).await?;
        Ok(())
    }

    pub async fn cancel(&self, job: Option<i64>, all: bool) -> Result<()> {
        if all {
            let summary = self.orchestrator.cancel_all().await?;
            println!("Cancelled {} jobs", summary.cancelled);
            if summary.failed > 0 {
                bail!("Failed to cancel {} jobs", summary.failed);
            }
            return Ok(());
        }

        let id = self.job_or_latest(job).await?;
        match self.orchestrator.cancel_job(id).await? {
            CancelOutcome::Cancelled(_) => println!("Job {} cancelled", id),
            CancelOutcome::NotActive(status) => {
                println!("Job {} is already {}, nothing to cancel", id, status)
            }
        }
        Ok(())
    }

    pub async fn clean(&self, job: Option<i64>) -> Result<()> {
        let deleted = match job {
            Some(id) => self.orchestrator.clean_job(id).await?,
            None => self.orchestrator.clean_all().await?,
        };
        println!("Deleted {} objects", deleted);
        Ok(())
    }

    pub async fn pull(&self, dest: &Path, job: Option<i64>) -> Result<()> {
        let id = match job {
            Some(id) => id,
            None => self.registry().latest_completed_job().await?.id,
        };
        let summary = self.orchestrator.pull(id, dest).await?;
        if summary.is_empty() {
            println!("Job {} has no output to download", id);
            return Ok(());
        }
        println!(
            "Downloaded {} files from job {} to {}",
            summary.files.len(),
            id,
            dest.display()
        );
        if let Some(log) = summary.log {
            println!("Log saved to {}", log.display());
        }
        Ok(())
    }

    pub async fn state_list(&self) -> Result<()> {
        let state = self.registry().state().await?;
        for job in state.jobs() {
            println!("{}\t{}\t{}", job.id, job.status, job.name);
        }
        for (droplet, jobs) in state.jobs_by_instance() {
            if jobs.len() > 1 {
                println!("Warning: droplet {} is bound to jobs {:?}", droplet, jobs);
            }
        }
        Ok(())
    }

    pub async fn state_json(&self) -> Result<()> {
        let state = self.registry().state().await?;
        println!("{}", serde_json::to_string_pretty(&state)?);
        Ok(())
    }

    pub async fn state_rm(&self, id: i64) -> Result<()> {
        if self.registry().delete_job(id).await? {
            println!("Removed job {} from state", id);
        } else {
            println!("Job {} not found in state", id);
        }
        Ok(())
    }

    pub async fn state_mark(&self, id: i64, status: &str) -> Result<()> {
        let status: JobStatus = status.parse()?;
        let job = self.registry().set_status(id, status).await?;
        println!("Job {} is now {}", job.id, job.status);
        Ok(())
    }
}

/// Merge `args` into the settings file at `path`
pub fn configure(path: &Path, args: ConfigureArgs) -> Result<Settings> {
    let mut settings = Settings::load_with(path, |_| None)?;

    let digitalocean = &mut settings.digitalocean;
    for (field, value) in [
        (&mut settings.username, args.username),
        (&mut digitalocean.api_key, args.api_key),
        (&mut digitalocean.spaces_access_key, args.spaces_access_key),
        (&mut digitalocean.spaces_secret_key, args.spaces_secret_key),
        (&mut digitalocean.spaces_region, args.spaces_region),
    ] {
        if let Some(value) = value {
            *field = value;
        }
    }

    settings.save(path)?;
    info!(path = %path.display(), "Configuration saved");
    Ok(settings)
}

/// Write a template `cloudexec.toml` into `dir`
pub fn init(dir: &Path) -> Result<PathBuf> {
    let path = dir.join(LAUNCH_CONFIG_FILE);
    launch_config::write_template(&path)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configure_merges_into_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        configure(
            &path,
            ConfigureArgs {
                username: Some("alice".to_string()),
                api_key: Some("dop_v1_one".to_string()),
                spaces_region: Some("nyc3".to_string()),
                ..Default::default()
            },
        )
        .unwrap();

        let settings = configure(
            &path,
            ConfigureArgs {
                api_key: Some("dop_v1_two".to_string()),
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(settings.username, "alice");
        assert_eq!(settings.digitalocean.api_key, "dop_v1_two");
        assert_eq!(settings.digitalocean.spaces_region, "nyc3");

        let reloaded = Settings::load_with(&path, |_| None).unwrap();
        assert_eq!(reloaded, settings);
    }

    #[test]
    fn test_init_writes_template_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = init(dir.path()).unwrap();
        assert!(path.ends_with(LAUNCH_CONFIG_FILE));
        assert!(init(dir.path()).is_err());
    }

    #[test]
    fn test_app_requires_credentials() {
        let mut settings = Settings::default();
        settings.username = "alice".to_string();
        let err = App::new(settings).err().unwrap();
        assert!(err.to_string().contains("digitalocean.api_key"));
    }
}
