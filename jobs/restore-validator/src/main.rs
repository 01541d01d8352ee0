use anyhow::Context;
use aws_config::SdkConfig;
use aws_sdk_dynamodb::Client as DynamoClient;
use aws_sdk_s3::Client as S3Client;
use aws_sdk_ssm::Client as SsmClient;
use bnr_common::config::{
    load_aws_config, optional_env, required_env, DynamoSettings, SsmParameterStore,
};
use bnr_common::provider::DynamoTableProvider;
use bnr_common::store::S3ObjectStore;
use bnr_common::{report_failure, BackupRecord, MetadataStore, Notifiers};
use restore_validator::{report_validation, RestoreValidator};
use std::sync::Arc;
use tracing::{error, info, warn};

const JOB_NAME: &str = "DynamoDBRestoreValidation";

struct Target {
    table: String,
    record: Option<BackupRecord>,
    validator: RestoreValidator,
}

/// Reads the job inputs and the backup record to validate against.
async fn prepare(config: &SdkConfig, settings: &DynamoSettings) -> anyhow::Result<Target> {
    let table = required_env("TargetTableName")?;
    let source = required_env("TableNameForBackup")?;
    let backup_arn = optional_env("BackupArn");

    let metadata = MetadataStore::new(
        Arc::new(S3ObjectStore::new(
            S3Client::new(config),
            &settings.metadata.bucket,
        )),
        &settings.metadata.key,
    );
    let document = metadata
        .read_or_default()
        .await
        .context("reading backup metadata")?
        .document;
    let record = match &backup_arn {
        Some(arn) => document.find(&source, arn),
        None => document.latest(&source),
    };
    if record.is_none() {
        warn!("No backup record of {} found, checking readiness only", source);
    }

    let validator =
        RestoreValidator::from_env(Arc::new(DynamoTableProvider::new(DynamoClient::new(config))))?;
    Ok(Target {
        table,
        record: record.cloned(),
        validator,
    })
}

async fn run() -> anyhow::Result<()> {
    let config = load_aws_config().await;
    let params = SsmParameterStore::new(SsmClient::new(&config));
    let settings = DynamoSettings::load(&params)
        .await
        .context("loading DynamoDB job settings")?;
    let notifiers = Notifiers::standard(&config, &settings.alerts, JOB_NAME);

    let target = match prepare(&config, &settings).await {
        Ok(target) => target,
        Err(e) => {
            let context = "Restore validation could not start";
            return Err(
                report_failure(&notifiers, "Restore Metadata Validation Failed!", context, e)
                    .await,
            );
        }
    };

    let result = target
        .validator
        .validate(&target.table, target.record.as_ref())
        .await;
    report_validation(&notifiers, &target.table, &result).await;

    let report = result?;
    info!(verdict = ?report.verdict, attempts = report.attempts, "Validation finished");
    println!("{}", serde_json::to_string(&report)?);
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
