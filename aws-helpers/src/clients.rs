use aws_config::meta::region::RegionProviderChain;
use aws_config::{BehaviorVersion, Region};
use tracing::debug;

/// Builds the SQS client a reader polls with.
///
/// A configured region takes precedence, otherwise the default
/// provider chain resolves one from the environment. A custom endpoint
/// routes all traffic away from the regional one, which is how the
/// reader is pointed at VPC endpoints and emulators such as
/// LocalStack.
pub async fn build_sqs_client(
    region: Option<String>,
    endpoint: Option<String>,
) -> aws_sdk_sqs::Client {
    let region_provider =
        RegionProviderChain::first_try(region.map(Region::new)).or_default_provider();
    let sdk_config = aws_config::defaults(BehaviorVersion::v2025_01_17())
        .region(region_provider)
        .load()
        .await;

    let mut builder = aws_sdk_sqs::config::Builder::from(&sdk_config);
    if let Some(endpoint) = endpoint {
        debug!(%endpoint, "routing sqs traffic to a custom endpoint");
        builder = builder.endpoint_url(endpoint);
    }
    aws_sdk_sqs::Client::from_conf(builder.build())
}
