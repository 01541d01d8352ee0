use anyhow::{bail, Context};
use aws_sdk_dynamodb::Client as DynamoClient;
use aws_sdk_s3::Client as S3Client;
use aws_sdk_ssm::Client as SsmClient;
use bnr_common::config::{load_aws_config, required_env, DynamoSettings, SsmParameterStore};
use bnr_common::provider::DynamoTableProvider;
use bnr_common::store::S3ObjectStore;
use bnr_common::{
    report_failure, BnrError, MetadataStore, Notifier, Notifiers, Outcome, RetentionConfigStore,
};
use chrono::Utc;
use retention_sweeper::{RetentionSweeper, SweepReport, JOB_NAME};
use std::sync::Arc;
use tracing::{error, info};

async fn report(
    notifiers: &Notifiers,
    what: &str,
    result: &Result<SweepReport, BnrError>,
) -> bool {
    match result {
        Ok(report) if report.has_failures() => {
            notifiers
                .report(
                    &format!("{what} Cleanup Incomplete"),
                    &report.summary(),
                    Outcome::Failure,
                )
                .await;
            true
        }
        Ok(report) => {
            notifiers
                .report(
                    &format!("{what} Cleanup Completed"),
                    &report.summary(),
                    Outcome::Success,
                )
                .await;
            false
        }
        Err(e) => {
            report_failure(
                notifiers,
                &format!("{what} Cleanup Failed!"),
                &format!("{what} cleanup could not run"),
                e,
            )
            .await;
            true
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let config = load_aws_config().await;
    let params = SsmParameterStore::new(SsmClient::new(&config));
    let settings = DynamoSettings::load(&params)
        .await
        .context("loading DynamoDB job settings")?;
    let notifiers = Notifiers::standard(&config, &settings.alerts, JOB_NAME);

    let objects = Arc::new(S3ObjectStore::new(
        S3Client::new(&config),
        &settings.metadata.bucket,
    ));
    let sweeper = RetentionSweeper::new(
        Arc::new(DynamoTableProvider::new(DynamoClient::new(&config))),
        MetadataStore::new(objects.clone(), &settings.metadata.key),
        RetentionConfigStore::new(objects, &settings.retention_config.key),
    );

    let now = Utc::now();
    let failed = match std::env::args().nth(1).as_deref() {
        Some("teardown") => {
            let table_name = match required_env("TargetTableName") {
                Ok(table_name) => table_name,
                Err(e) => {
                    let context = "Deletion of the restored table could not start";
                    return Err(report_failure(&notifiers, "Resource Deletion Failed!", context, e)
                        .await
                        .into());
                }
            };
            if let Err(e) = sweeper.teardown(&table_name).await {
                let context = format!("Deletion of table {table_name} failed");
                return Err(report_failure(&notifiers, "Resource Deletion Failed!", &context, e)
                    .await
                    .into());
            }
            false
        }
        Some("tables") => {
            let tables = sweeper.sweep_restored_tables(now).await;
            report(&notifiers, "Restored Table", &tables).await
        }
        Some("backups") => {
            let backups = sweeper.sweep_backups(now).await;
            report(&notifiers, "Backup", &backups).await
        }
        None | Some("all") => {
            let sweep = sweeper.sweep_all(now).await;
            report(&notifiers, "Backup", &sweep.backups).await;
            report(&notifiers, "Restored Table", &sweep.tables).await;
            if let (Ok(backups), Ok(tables)) = (&sweep.backups, &sweep.tables) {
                info!(
                    backups = %serde_json::to_string(backups)?,
                    tables = %serde_json::to_string(tables)?,
                    "Sweep finished"
                );
            }
            sweep.has_failures()
        }
        Some(other) => bail!("unknown sweep target '{other}', expected all, backups, tables or teardown"),
    };

    if failed {
        bail!("some expired resources could not be deleted");
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
