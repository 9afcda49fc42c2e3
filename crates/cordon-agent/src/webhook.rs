//! Optional notification sent after a node action completes.

use std::collections::HashMap;

use cordon_types::event::InterruptionEvent;
use cordon_types::node_metadata::InstanceMetadata;

use crate::error::WebhookError;

const NODE_NAME_PLACEHOLDER: &str = "{{node_name}}";

/// Configuration the notifier needs beyond the event itself: template,
/// extra headers, and an optional outbound proxy.
pub struct WebhookConfig<'a> {
    pub url: &'a str,
    pub template: &'a str,
    pub headers: &'a HashMap<String, String>,
}

/// Renders the configured template against `node_metadata` and `event`,
/// then posts it per `config`. The template is free-form text (a JSON
/// body is the common case, but nothing here assumes it): this just does
/// placeholder substitution.
pub async fn post(
    http: &reqwest::Client,
    node_metadata: &InstanceMetadata,
    event: &InterruptionEvent,
    action: &str,
    config: &WebhookConfig<'_>,
) -> Result<(), WebhookError> {
    let body = render(config.template, node_metadata, event, action)?;

    let mut request = http
        .post(config.url)
        .header("Content-Type", "application/json");
    for (name, value) in config.headers {
        request = request.header(name, value);
    }

    let response = request.body(body).send().await?;

    if let Err(err) = response.error_for_status_ref() {
        return Err(WebhookError::Request(err));
    }
    Ok(())
}

fn render(
    template: &str,
    node_metadata: &InstanceMetadata,
    event: &InterruptionEvent,
    action: &str,
) -> Result<String, WebhookError> {
    if !template.contains(NODE_NAME_PLACEHOLDER) {
        return Err(WebhookError::MissingPlaceholder("{{node_name}}"));
    }

    Ok(template
        .replace(NODE_NAME_PLACEHOLDER, &event.node_name)
        .replace("{{action}}", action)
        .replace("{{event_id}}", &event.event_id)
        .replace("{{event_kind}}", event.kind.as_str())
        .replace("{{description}}", &event.description)
        .replace("{{instance_id}}", &node_metadata.instance_id)
        .replace("{{instance_type}}", &node_metadata.instance_type)
        .replace("{{availability_zone}}", &node_metadata.availability_zone)
        .replace("{{hostname}}", &node_metadata.hostname))
}
