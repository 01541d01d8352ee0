use anyhow::{bail, Context};
use aws_sdk_s3::Client as S3Client;
use aws_sdk_ssm::Client as SsmClient;
use bnr_common::config::{load_aws_config, optional_env, parse_env, required_env, SsmParameterStore};
use bnr_common::pipeline::PipelineOutput;
use bnr_common::store::S3ObjectStore;
use bnr_common::{Notifier, Notifiers, Outcome, RetentionConfigStore, RetentionDays};
use chrono::Utc;
use cluster_manager::client::OpsCenterClient;
use cluster_manager::settings::{
    load_profile, ClusterJobSettings, ClusterSettingsStore, DEFAULT_PROFILE, DEFAULT_SETTINGS_KEY,
};
use cluster_manager::{
    format_event_time, ClusterManagerService, ClusterRestoreRequest, KeyspaceSelection,
    BACKUP_JOB_NAME, RESTORE_JOB_NAME,
};
use std::sync::Arc;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Backup,
    Restore,
    List,
    Keyspaces,
    RegisterRetention,
}

impl Command {
    fn parse(raw: Option<&str>) -> anyhow::Result<Self> {
        Ok(match raw {
            None | Some("backup") => Self::Backup,
            Some("restore") => Self::Restore,
            Some("list") => Self::List,
            Some("keyspaces") => Self::Keyspaces,
            Some("register-retention") => Self::RegisterRetention,
            Some(other) => bail!(
                "unknown command '{other}', expected backup, restore, list, keyspaces or register-retention"
            ),
        })
    }

    fn job_name(self) -> &'static str {
        match self {
            Self::Restore | Self::RegisterRetention => RESTORE_JOB_NAME,
            _ => BACKUP_JOB_NAME,
        }
    }

    fn failure_title(self) -> &'static str {
        match self {
            Self::Backup => "Cassandra Backup Operation Failed!",
            Self::Restore => "Cassandra Restore Failed!",
            Self::List => "Cassandra Backup Listing Failed!",
            Self::Keyspaces => "Cassandra Keyspace Export Failed!",
            Self::RegisterRetention => "Cassandra Retention Registration Failed!",
        }
    }
}

/// Connects to the profile's OpsCenter and runs `command`. Only successes are
/// reported here.
async fn execute(
    command: Command,
    config: &aws_config::SdkConfig,
    settings: &ClusterJobSettings,
    notifiers: &Notifiers,
    profile_name: &str,
) -> anyhow::Result<()> {
    let objects = Arc::new(S3ObjectStore::new(
        S3Client::new(config),
        &settings.cluster_settings.bucket,
    ));
    let profile = load_profile(
        &ClusterSettingsStore::new(objects.clone(), &settings.cluster_settings.key),
        profile_name,
    )
    .await
    .with_context(|| format!("loading cluster profile {profile_name}"))?;
    let cluster =
        optional_env("ClusterNameForBackup").unwrap_or_else(|| profile.opscenter_cluster_name.clone());

    let client = Arc::new(OpsCenterClient::new(
        reqwest::Client::new(),
        &profile.address(),
        &cluster,
    ));
    let session = client
        .login(&settings.credentials)
        .await
        .with_context(|| format!("logging in to OpsCenter at {}", profile.address()))?;
    let service = ClusterManagerService::new(
        client,
        &profile.s3_backup_path,
        RetentionConfigStore::new(objects, &settings.retention_config.key),
        PipelineOutput::from_env(),
    );

    match command {
        Command::Backup => {
            let selection =
                KeyspaceSelection::parse(optional_env("CassandraKeySpacesNames").as_deref());
            let summary = service
                .run_backup(&session, &selection)
                .await
                .with_context(|| format!("backing up cluster {cluster}"))?;
            notifiers
                .report(
                    "Cassandra Backup Operation Successful",
                    &format!(
                        "Backup of keyspaces {} in cluster {} stored at destination {}",
                        summary.keyspaces.join(","),
                        cluster,
                        summary.destination_id
                    ),
                    Outcome::Success,
                )
                .await;
            println!("{}", serde_json::to_string(&summary)?);
        }
        Command::Restore => {
            let request = ClusterRestoreRequest::from_env()?;
            let summary = service
                .run_restore(&session, &request)
                .await
                .with_context(|| format!("restoring cluster {cluster}"))?;
            notifiers
                .report(
                    "Cassandra Restore Started!",
                    &format!(
                        "Restore of cluster {} from backup {} started into {}",
                        cluster, summary.backup_id, summary.target_cluster
                    ),
                    Outcome::Success,
                )
                .await;
            println!("{}", serde_json::to_string(&summary)?);
        }
        Command::List => {
            let backups = service.s3_backups(&session).await?;
            if backups.is_empty() {
                println!("No Backup Found on S3");
            } else {
                println!("{:<50} {:<10}", "Backup Id", "Timestamp");
                for backup in &backups {
                    println!("{:<50} {:<10}", backup.backup_id, format_event_time(backup.event_time));
                }
            }
        }
        Command::Keyspaces => {
            let keyspaces = service.export_keyspaces(&session).await?;
            info!("Cluster {} has keyspaces {}", cluster, keyspaces.join(","));
        }
        Command::RegisterRetention => {
            let target = required_env("TargetClusterName")?;
            let days = parse_env("ClusterRetention", RetentionDays::FOREVER)?;
            service.register_retention(&target, days, Utc::now()).await?;
        }
    }
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    let command = Command::parse(std::env::args().nth(1).as_deref())?;

    let config = load_aws_config().await;
    let params = SsmParameterStore::new(SsmClient::new(&config));
    let settings_key =
        optional_env("ClusterSettingsKey").unwrap_or_else(|| DEFAULT_SETTINGS_KEY.to_string());
    let settings = ClusterJobSettings::load(&params, &settings_key)
        .await
        .context("loading cluster job settings")?;
    let notifiers = Notifiers::standard(&config, &settings.alerts, command.job_name());

    let profile_name = optional_env("ClusterProfile").unwrap_or_else(|| DEFAULT_PROFILE.to_string());
    if let Err(e) = execute(command, &config, &settings, &notifiers, &profile_name).await {
        notifiers
            .report(
                command.failure_title(),
                &format!("Cassandra job for profile {profile_name} failed\nReason: {e:#}"),
                Outcome::Failure,
            )
            .await;
        return Err(e);
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    if let Err(e) = run().await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}
