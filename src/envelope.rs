//! OTLP envelope construction and gzip encoding.
//!
//! One export call carries one `ResourceLogs` (the resource attributes) with a
//! single `ScopeLogs` holding the batch's records in order.

use std::io::Read;

use flate2::read::GzEncoder;
use flate2::Compression as GZCompression;
use opentelemetry_proto::tonic::collector::logs::v1::ExportLogsServiceRequest;
use opentelemetry_proto::tonic::common::v1::{any_value, AnyValue, InstrumentationScope, KeyValue};
use opentelemetry_proto::tonic::logs::v1::{LogRecord as OtlpLogRecord, ResourceLogs, ScopeLogs};
use opentelemetry_proto::tonic::resource::v1::Resource;
use prost::Message;

use crate::record::{Attributes, LogRecord, ResourceContext};

pub const SCOPE_NAME: &str = "logsink";

pub fn build_request(records: &[LogRecord], resource: &ResourceContext) -> ExportLogsServiceRequest {
    let scope_logs = ScopeLogs {
        scope: Some(InstrumentationScope {
            name: SCOPE_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            ..Default::default()
        }),
        log_records: records.iter().map(to_otlp_record).collect(),
        ..Default::default()
    };

    ExportLogsServiceRequest {
        resource_logs: vec![ResourceLogs {
            resource: Some(Resource {
                attributes: to_key_values(resource.attributes()),
                ..Default::default()
            }),
            scope_logs: vec![scope_logs],
            ..Default::default()
        }],
    }
}

/// Serialize the request and gzip it for an HTTP body.
pub fn encode_gzip(request: &ExportLogsServiceRequest) -> std::io::Result<Vec<u8>> {
    let uncompressed = request.encode_to_vec();

    let mut gz = GzEncoder::new(&uncompressed[..], GZCompression::default());
    let mut buffer = Vec::with_capacity(uncompressed.len() / 2);
    gz.read_to_end(&mut buffer)?;

    Ok(buffer)
}

fn to_otlp_record(record: &LogRecord) -> OtlpLogRecord {
    OtlpLogRecord {
        time_unix_nano: record.time_unix_nano(),
        observed_time_unix_nano: record.observed_time_unix_nano(),
        severity_number: record.severity().otlp_number(),
        severity_text: record.severity_text().to_string(),
        body: Some(string_value(record.body())),
        attributes: to_key_values(record.attributes()),
        ..Default::default()
    }
}

fn to_key_values(attributes: &Attributes) -> Vec<KeyValue> {
    attributes
        .iter()
        .map(|(key, value)| KeyValue {
            key: key.to_string(),
            value: Some(string_value(value)),
        })
        .collect()
}

fn string_value(value: &str) -> AnyValue {
    AnyValue {
        value: Some(any_value::Value::StringValue(value.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Severity;
    use flate2::read::GzDecoder;

    fn decode(body: &[u8]) -> ExportLogsServiceRequest {
        let mut raw = Vec::new();
        GzDecoder::new(body).read_to_end(&mut raw).unwrap();
        ExportLogsServiceRequest::decode(raw.as_slice()).unwrap()
    }

    #[test]
    fn test_envelope_shape() {
        let resource = ResourceContext::for_service(
            "payments",
            &[("env", "prod")].into_iter().collect(),
        );
        let records = vec![
            LogRecord::new("first")
                .with_time(1_000)
                .with_observed_time(2_000)
                .with_severity(Severity::Info)
                .with_attribute("stream", "app"),
            LogRecord::new("second").with_severity(Severity::Error),
        ];

        let request = build_request(&records, &resource);
        assert_eq!(request.resource_logs.len(), 1);

        let resource_logs = &request.resource_logs[0];
        let attrs = &resource_logs.resource.as_ref().unwrap().attributes;
        assert_eq!(attrs[0].key, "service.name");
        assert_eq!(attrs[1].key, "env");

        assert_eq!(resource_logs.scope_logs.len(), 1);
        let scope = &resource_logs.scope_logs[0];
        assert_eq!(scope.scope.as_ref().unwrap().name, SCOPE_NAME);

        let first = &scope.log_records[0];
        assert_eq!(first.time_unix_nano, 1_000);
        assert_eq!(first.observed_time_unix_nano, 2_000);
        assert_eq!(first.severity_number, 9);
        assert_eq!(first.severity_text, "INFO");
        assert_eq!(
            first.body.as_ref().unwrap().value,
            Some(any_value::Value::StringValue("first".to_string()))
        );
        assert_eq!(first.attributes[0].key, "stream");

        assert_eq!(scope.log_records[1].severity_number, 17);
    }

    #[test]
    fn test_gzip_body_decodes_to_request() {
        let resource = ResourceContext::for_service("svc", &Attributes::new());
        let records: Vec<_> = (0..50)
            .map(|i| LogRecord::new(format!("line {}", i)))
            .collect();
        let request = build_request(&records, &resource);

        let body = encode_gzip(&request).unwrap();
        assert_eq!(&body[..2], &[0x1f, 0x8b]);
        assert_eq!(decode(&body), request);
    }
}
