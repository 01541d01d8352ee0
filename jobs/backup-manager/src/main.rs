use anyhow::Context;
use aws_sdk_dynamodb::Client as DynamoClient;
use aws_sdk_s3::Client as S3Client;
use aws_sdk_ssm::Client as SsmClient;
use backup_manager::{BackupManagerService, Request, JOB_NAME};
use bnr_common::config::{load_aws_config, required_env, DynamoSettings, SsmParameterStore};
use bnr_common::provider::DynamoTableProvider;
use bnr_common::store::S3ObjectStore;
use bnr_common::{report_failure, MetadataStore, Notifiers};
use std::sync::Arc;
use tracing::{error, info};

async fn list_backups(service: &BackupManagerService) -> anyhow::Result<()> {
    let table_name = required_env("TableNameForBackup")?;
    let backups = service.list_backups(&table_name).await?;
    println!("{}", serde_json::to_string_pretty(&backups)?);
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    let config = load_aws_config().await;
    let params = SsmParameterStore::new(SsmClient::new(&config));
    let settings = DynamoSettings::load(&params)
        .await
        .context("loading DynamoDB job settings")?;

    let notifiers = Arc::new(Notifiers::standard(&config, &settings.alerts, JOB_NAME));
    let objects = Arc::new(S3ObjectStore::new(
        S3Client::new(&config),
        &settings.metadata.bucket,
    ));
    let service = BackupManagerService::new(
        Arc::new(DynamoTableProvider::new(DynamoClient::new(&config))),
        MetadataStore::new(objects, &settings.metadata.key),
        notifiers.clone(),
    );

    if std::env::args().nth(1).as_deref() == Some("list") {
        if let Err(e) = list_backups(&service).await {
            let context = "Listing DynamoDB backups failed";
            return Err(
                report_failure(notifiers.as_ref(), "Backup Listing Failed!", context, e).await,
            );
        }
        return Ok(());
    }

    let request = match Request::from_env() {
        Ok(request) => request,
        Err(e) => {
            let context = "Backup of DynamoDB table could not start";
            return Err(report_failure(
                notifiers.as_ref(),
                "DynamoDB Backup Operation Failed!",
                context,
                e,
            )
            .await
            .into());
        }
    };
    // The service reports its own outcome from here on.
    let response = service
        .run_backup(&request.table_name, request.retention_days)
        .await?;
    info!(status = ?response.status, backup_id = %response.backup_id, "Backup finished");
    println!("{}", serde_json::to_string(&response)?);
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
