//! Outcome reporting. Sinks never fail the job: a sink that cannot deliver
//! logs the problem and moves on.

use async_trait::async_trait;
use aws_sdk_cloudwatch::types::{MetricDatum, StandardUnit};
use aws_sdk_cloudwatch::Client as CloudWatchClient;
use aws_sdk_sesv2::types::{Body, Content, Destination, EmailContent, Message};
use aws_sdk_sesv2::Client as SesClient;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::{region_name, AlertSettings};

pub const METRIC_NAMESPACE: &str = "BackupAndRestore";

const CHARSET: &str = "UTF-8";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn report(&self, title: &str, message: &str, outcome: Outcome);
}

/// Writes the report to the structured log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn report(&self, title: &str, message: &str, outcome: Outcome) {
        match outcome {
            Outcome::Success => info!(title = %title, "{}", message),
            Outcome::Failure => error!(title = %title, "{}", message),
        }
    }
}

pub fn success_template(content: &str) -> String {
    format!(
        "<html><head></head><body><h3 style='color:green'>Success</h3><p>{}</p></body></html>",
        content.replace('\n', "<br>")
    )
}

pub fn failure_template(content: &str) -> String {
    format!(
        "<html><head></head><body><h3 style='color:red'>Failure</h3><p>{}</p></body></html>",
        content.replace('\n', "<br>")
    )
}

/// Sends an HTML email through SES.
pub struct EmailNotifier {
    client: SesClient,
    sender: String,
    recipients: Vec<String>,
}

impl EmailNotifier {
    pub fn new(client: SesClient, sender: impl Into<String>, recipients: Vec<String>) -> Self {
        Self {
            client,
            sender: sender.into(),
            recipients,
        }
    }

    fn content(data: &str) -> Option<Content> {
        match Content::builder().data(data).charset(CHARSET).build() {
            Ok(content) => Some(content),
            Err(e) => {
                error!("Failed to build email content: {}", e);
                None
            }
        }
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    async fn report(&self, title: &str, message: &str, outcome: Outcome) {
        if self.recipients.is_empty() {
            return;
        }

        let html = match outcome {
            Outcome::Success => success_template(message),
            Outcome::Failure => failure_template(message),
        };
        let (Some(subject), Some(html)) = (Self::content(title), Self::content(&html)) else {
            return;
        };

        let email = EmailContent::builder()
            .simple(
                Message::builder()
                    .subject(subject)
                    .body(Body::builder().html(html).build())
                    .build(),
            )
            .build();

        let destination = Destination::builder()
            .set_to_addresses(Some(self.recipients.clone()))
            .build();

        if let Err(e) = self
            .client
            .send_email()
            .from_email_address(&self.sender)
            .destination(destination)
            .content(email)
            .send()
            .await
        {
            error!(
                "Failed to send email '{}': {}",
                title,
                aws_sdk_sesv2::error::DisplayErrorContext(&e)
            );
        }
    }
}

/// Posts a MessageCard to chat webhooks, linking to the job's log group.
pub struct TeamsNotifier {
    http: reqwest::Client,
    webhooks: Vec<String>,
    region: String,
    log_group: String,
}

impl TeamsNotifier {
    pub fn new(
        http: reqwest::Client,
        webhooks: Vec<String>,
        region: impl Into<String>,
        log_group: impl Into<String>,
    ) -> Self {
        Self {
            http,
            webhooks,
            region: region.into(),
            log_group: log_group.into(),
        }
    }

    pub fn log_group_url(&self) -> String {
        format!(
            "https://console.aws.amazon.com/cloudwatch/home?region={}#logsV2:log-groups/log-group/{}",
            self.region, self.log_group
        )
    }

    pub fn message_card(&self, title: &str, message: &str) -> serde_json::Value {
        json!({
            "@type": "MessageCard",
            "@context": "http://schema.org/extensions",
            "summary": title,
            "sections": [{
                "activityTitle": title,
                "activitySubtitle": Utc::now().format("%m-%d-%Y %H:%M:%S").to_string(),
                "text": message,
                "potentialAction": [{
                    "@type": "OpenUri",
                    "name": "View CloudWatch Logs",
                    "targets": [{ "os": "default", "uri": self.log_group_url() }]
                }]
            }]
        })
    }
}

#[async_trait]
impl Notifier for TeamsNotifier {
    async fn report(&self, title: &str, message: &str, _outcome: Outcome) {
        let card = self.message_card(title, message);

        for webhook in &self.webhooks {
            match self.http.post(webhook).json(&card).send().await {
                Ok(response) if response.status().is_success() => {}
                Ok(response) => warn!(
                    "Webhook returned {} for '{}'",
                    response.status(),
                    title
                ),
                Err(e) => warn!("Failed to post '{}' to webhook: {}", title, e),
            }
        }
    }
}

/// Publishes 1 (success) or 0 (failure) as a CloudWatch metric.
pub struct MetricNotifier {
    client: CloudWatchClient,
    metric_name: String,
}

impl MetricNotifier {
    pub fn new(client: CloudWatchClient, job: &str) -> Self {
        Self {
            client,
            metric_name: format!("{job}Success"),
        }
    }
}

#[async_trait]
impl Notifier for MetricNotifier {
    async fn report(&self, _title: &str, _message: &str, outcome: Outcome) {
        let timestamp = std::time::SystemTime::now();

        let metric = MetricDatum::builder()
            .metric_name(&self.metric_name)
            .value(match outcome {
                Outcome::Success => 1.0,
                Outcome::Failure => 0.0,
            })
            .unit(StandardUnit::Count)
            .timestamp(aws_sdk_cloudwatch::primitives::DateTime::from(timestamp))
            .build();

        if let Err(e) = self
            .client
            .put_metric_data()
            .namespace(METRIC_NAMESPACE)
            .metric_data(metric)
            .send()
            .await
        {
            error!("Failed to publish metric {}: {}", self.metric_name, e);
        }
    }
}

/// Reports `error` as a failure and hands it back, for early returns.
pub async fn report_failure<E: fmt::Display>(
    notifier: &dyn Notifier,
    title: &str,
    context: &str,
    error: E,
) -> E {
    notifier
        .report(title, &format!("{context}\nReason: {error}"), Outcome::Failure)
        .await;
    error
}

/// Fans a report out to every configured sink, in order.
#[derive(Clone, Default)]
pub struct Notifiers {
    sinks: Vec<Arc<dyn Notifier>>,
}

impl Notifiers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl Notifier + 'static) -> Self {
        self.sinks.push(Arc::new(sink));
        self
    }

    pub fn with_shared(mut self, sink: Arc<dyn Notifier>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Log, email, chat and metric sinks for `job`.
    pub fn standard(config: &aws_config::SdkConfig, alerts: &AlertSettings, job: &str) -> Self {
        let mut notifiers = Self::new().with(LogNotifier).with(EmailNotifier::new(
            SesClient::new(config),
            alerts.sender.clone(),
            alerts.recipients.clone(),
        ));
        if !alerts.webhooks.is_empty() {
            notifiers = notifiers.with(TeamsNotifier::new(
                reqwest::Client::new(),
                alerts.webhooks.clone(),
                region_name(config),
                alerts.log_group.clone(),
            ));
        }
        notifiers.with(MetricNotifier::new(CloudWatchClient::new(config), job))
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

#[async_trait]
impl Notifier for Notifiers {
    async fn report(&self, title: &str, message: &str, outcome: Outcome) {
        for sink in &self.sinks {
            sink.report(title, message, outcome).await;
        }
    }
}
