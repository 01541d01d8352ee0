use anyhow::Context;
use aws_sdk_dynamodb::Client as DynamoClient;
use aws_sdk_s3::Client as S3Client;
use aws_sdk_ssm::Client as SsmClient;
use bnr_common::config::{
    load_aws_config, parse_env, required_env, DynamoSettings, SsmParameterStore,
};
use bnr_common::pipeline::PipelineOutput;
use bnr_common::provider::DynamoTableProvider;
use bnr_common::store::S3ObjectStore;
use bnr_common::{
    report_failure, MetadataStore, Notifiers, RetentionConfigStore, RetentionDays,
};
use chrono::Utc;
use restore_manager::{RestoreManagerService, RestoreRequest, JOB_NAME};
use restore_validator::RestoreValidator;
use std::sync::Arc;
use tracing::{error, info};

async fn register_retention(service: &RestoreManagerService) -> anyhow::Result<()> {
    let target = required_env("TargetTableName")?;
    let days = parse_env("TableRetention", RetentionDays::FOREVER)?;
    service.register_retention(&target, days, Utc::now()).await?;
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
    let provider = Arc::new(DynamoTableProvider::new(DynamoClient::new(&config)));
    let validator = match RestoreValidator::from_env(provider.clone()) {
        Ok(validator) => validator,
        Err(e) => {
            let context = "Restore of DynamoDB table could not start";
            return Err(report_failure(notifiers.as_ref(), "Restore Failed!", context, e)
                .await
                .into());
        }
    };
    let service = RestoreManagerService::new(
        provider,
        MetadataStore::new(objects.clone(), &settings.metadata.key),
        RetentionConfigStore::new(objects, &settings.retention_config.key),
        validator,
        PipelineOutput::from_env(),
        notifiers.clone(),
    );

    if std::env::args().nth(1).as_deref() == Some("register-retention") {
        if let Err(e) = register_retention(&service).await {
            let context = "Registering the restored table for cleanup failed";
            return Err(
                report_failure(notifiers.as_ref(), "Retention Registration Failed!", context, e)
                    .await,
            );
        }
        return Ok(());
    }

    let request = match RestoreRequest::from_env() {
        Ok(request) => request,
        Err(e) => {
            let context = "Restore of DynamoDB table could not start";
            return Err(report_failure(notifiers.as_ref(), "Restore Failed!", context, e)
                .await
                .into());
        }
    };
    // Failures past this point are reported by the service itself.
    let outcome = service.run_restore(&request).await?;
    info!(target_table = %outcome.target_table, "Restore finished");
    println!("{}", serde_json::to_string(&outcome)?);
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
