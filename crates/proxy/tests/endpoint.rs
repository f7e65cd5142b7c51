//! End-to-end tests: configuration in, aggregated HTTP endpoint out.

use std::collections::HashMap;
use std::io::Read;
use std::net::SocketAddr;

use axum::extract::Query;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use reverse_exporter_expfmt::{self as expfmt, Format, MetricFamily};
use reverse_exporter_proxy::build_router;

const TEXT_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Starts an upstream exporter that always answers with `status` and `body`.
async fn spawn_upstream(status: StatusCode, body: &str) -> String {
    let body = body.to_string();
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let body = body.clone();
            async move { (status, [(header::CONTENT_TYPE, TEXT_CONTENT_TYPE)], body) }
        }),
    );
    let addr = serve(app).await;
    format!("http://{addr}/metrics")
}

/// Starts an upstream that reflects the `target` query parameter back as a
/// label value.
async fn spawn_reflecting_upstream() -> String {
    async fn reflect(Query(params): Query<HashMap<String, String>>) -> impl IntoResponse {
        let target = params.get("target").cloned().unwrap_or_default();
        (
            StatusCode::OK,
            [(header::CONTENT_TYPE, TEXT_CONTENT_TYPE)],
            format!("probe{{target=\"{target}\"}} 1\n"),
        )
    }
    let addr = serve(Router::new().route("/metrics", get(reflect))).await;
    format!("http://{addr}/metrics")
}

async fn serve_config(yaml: &str) -> SocketAddr {
    let config = reverse_exporter_config::load_from_str(yaml).unwrap();
    let router = build_router(&config).unwrap();
    serve(router).await
}

fn sample_labels(metric: &reverse_exporter_expfmt::Metric) -> Vec<(String, String)> {
    metric
        .label
        .iter()
        .map(|pair| {
            (
                pair.name.clone().unwrap_or_default(),
                pair.value.clone().unwrap_or_default(),
            )
        })
        .collect()
}

fn find_family<'a>(families: &'a [MetricFamily], name: &str) -> &'a MetricFamily {
    families
        .iter()
        .find(|family| family.name() == name)
        .unwrap_or_else(|| panic!("no family named {name:?}"))
}

#[tokio::test]
async fn merges_two_http_sources_with_rewritten_labels() {
    let up1 = spawn_upstream(StatusCode::OK, "m 1\n").await;
    let up2 = spawn_upstream(StatusCode::OK, "m 2\n").await;
    let addr = serve_config(&format!(
        r#"
reverse_exporters:
  - path: /metrics
    exporters:
      http:
        - name: a
          address: {up1}
        - name: b
          address: {up2}
          labels:
            region: eu
"#
    ))
    .await;

    let response = reqwest::get(format!("http://{addr}/metrics")).await.unwrap();
    assert_eq!(response.status(), 200);
    let body = response.bytes().await.unwrap();
    let families = expfmt::decode(&body, Format::Text).unwrap();

    let family = find_family(&families, "m");
    assert_eq!(family.metric.len(), 2);
    let mut samples: Vec<(Vec<(String, String)>, f64)> = family
        .metric
        .iter()
        .map(|metric| {
            (
                sample_labels(metric),
                metric.untyped.as_ref().unwrap().value.unwrap(),
            )
        })
        .collect();
    samples.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap());

    assert_eq!(
        samples[0].0,
        vec![("exporter_name".to_string(), "a".to_string())]
    );
    assert_eq!(samples[0].1, 1.0);
    assert_eq!(
        samples[1].0,
        vec![
            ("exporter_name".to_string(), "b".to_string()),
            ("region".to_string(), "eu".to_string()),
        ]
    );
    assert_eq!(samples[1].1, 2.0);
}

#[tokio::test]
async fn one_failing_source_is_isolated() {
    let up1 = spawn_upstream(StatusCode::INTERNAL_SERVER_ERROR, "boom\n").await;
    let up2 = spawn_upstream(StatusCode::OK, "m 2\n").await;
    let addr = serve_config(&format!(
        r#"
reverse_exporters:
  - path: /metrics
    exporters:
      http:
        - name: a
          address: {up1}
        - name: b
          address: {up2}
          labels:
            region: eu
"#
    ))
    .await;

    let response = reqwest::get(format!("http://{addr}/metrics")).await.unwrap();
    assert_eq!(response.status(), 200);
    let body = response.bytes().await.unwrap();
    let families = expfmt::decode(&body, Format::Text).unwrap();

    let family = find_family(&families, "m");
    assert_eq!(family.metric.len(), 1);
    assert_eq!(
        sample_labels(&family.metric[0]),
        vec![
            ("exporter_name".to_string(), "b".to_string()),
            ("region".to_string(), "eu".to_string()),
        ]
    );
}

#[tokio::test]
async fn no_rewrite_keeps_labels_but_drops_exporter_name() {
    let dir = tempfile::TempDir::new().unwrap();
    let metrics_file = dir.path().join("metrics.prom");
    std::fs::write(&metrics_file, "m 3\n").unwrap();

    let addr = serve_config(&format!(
        r#"
reverse_exporters:
  - path: /metrics
    exporters:
      file:
        - name: c
          no_rewrite: true
          labels:
            job: x
          path: {}
"#,
        metrics_file.display()
    ))
    .await;

    let response = reqwest::get(format!("http://{addr}/metrics")).await.unwrap();
    let body = response.bytes().await.unwrap();
    let families = expfmt::decode(&body, Format::Text).unwrap();

    let family = find_family(&families, "m");
    assert_eq!(
        sample_labels(&family.metric[0]),
        vec![("job".to_string(), "x".to_string())]
    );
}

#[tokio::test]
async fn forwards_query_parameters_only_when_enabled() {
    let reflecting = spawn_reflecting_upstream().await;
    let addr = serve_config(&format!(
        r#"
reverse_exporters:
  - path: /metrics
    exporters:
      http:
        - name: fwd
          address: {reflecting}
          forward_url_params: true
        - name: nofwd
          address: {reflecting}
"#
    ))
    .await;

    let response = reqwest::get(format!("http://{addr}/metrics?target=192.0.2.7"))
        .await
        .unwrap();
    let body = response.bytes().await.unwrap();
    let families = expfmt::decode(&body, Format::Text).unwrap();

    let family = find_family(&families, "probe");
    let values: HashMap<String, String> = family
        .metric
        .iter()
        .map(|metric| {
            let labels = sample_labels(metric);
            let exporter = labels
                .iter()
                .find(|(name, _)| name == "exporter_name")
                .map(|(_, value)| value.clone())
                .unwrap();
            let target = labels
                .iter()
                .find(|(name, _)| name == "target")
                .map(|(_, value)| value.clone())
                .unwrap();
            (exporter, target)
        })
        .collect();

    assert_eq!(values["fwd"], "192.0.2.7");
    assert_eq!(values["nofwd"], "");
}

#[tokio::test]
async fn basic_auth_guards_the_endpoint() {
    let upstream = spawn_upstream(StatusCode::OK, "m 1\n").await;
    let addr = serve_config(&format!(
        r#"
reverse_exporters:
  - path: /metrics
    auth:
      basic_auth:
        - username: scraper
          password: hunter2
    exporters:
      http:
        - name: a
          address: {upstream}
"#
    ))
    .await;
    let client = reqwest::Client::new();

    let denied = client
        .get(format!("http://{addr}/metrics"))
        .send()
        .await
        .unwrap();
    assert_eq!(denied.status(), 401);
    assert!(denied.headers().get(header::WWW_AUTHENTICATE).is_some());

    let wrong = client
        .get(format!("http://{addr}/metrics"))
        .basic_auth("scraper", Some("wrong"))
        .send()
        .await
        .unwrap();
    assert_eq!(wrong.status(), 401);

    let granted = client
        .get(format!("http://{addr}/metrics"))
        .basic_auth("scraper", Some("hunter2"))
        .send()
        .await
        .unwrap();
    assert_eq!(granted.status(), 200);
    let families = expfmt::decode(&granted.bytes().await.unwrap(), Format::Text).unwrap();
    assert_eq!(find_family(&families, "m").metric.len(), 1);
}

#[tokio::test]
async fn gzip_encoding_is_applied_on_request() {
    let upstream = spawn_upstream(StatusCode::OK, "m 1\n").await;
    let addr = serve_config(&format!(
        r#"
reverse_exporters:
  - path: /metrics
    exporters:
      http:
        - name: a
          address: {upstream}
"#
    ))
    .await;

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{addr}/metrics"))
        .header(header::ACCEPT_ENCODING, "gzip")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get(header::CONTENT_ENCODING).unwrap(),
        "gzip"
    );

    let compressed = response.bytes().await.unwrap();
    let mut decoded = Vec::new();
    flate2::read::GzDecoder::new(compressed.as_ref())
        .read_to_end(&mut decoded)
        .unwrap();
    let families = expfmt::decode(&decoded, Format::Text).unwrap();
    assert_eq!(find_family(&families, "m").metric.len(), 1);
}

#[tokio::test]
async fn negotiates_protobuf_responses() {
    let upstream = spawn_upstream(StatusCode::OK, "# TYPE m counter\nm 4\n").await;
    let addr = serve_config(&format!(
        r#"
reverse_exporters:
  - path: /metrics
    exporters:
      http:
        - name: a
          address: {upstream}
"#
    ))
    .await;

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{addr}/metrics"))
        .header(
            header::ACCEPT,
            "application/vnd.google.protobuf;proto=io.prometheus.client.MetricFamily;\
             encoding=delimited",
        )
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(content_type.starts_with("application/vnd.google.protobuf"));

    let body = response.bytes().await.unwrap();
    let families = expfmt::decode(&body, Format::ProtoDelim).unwrap();
    let family = find_family(&families, "m");
    assert_eq!(
        family.metric[0].counter.as_ref().unwrap().value,
        Some(4.0)
    );
}

#[tokio::test]
async fn endpoints_are_mounted_under_the_context_path() {
    let upstream = spawn_upstream(StatusCode::OK, "m 1\n").await;
    let addr = serve_config(&format!(
        r#"
web:
  context_path: /exporters
reverse_exporters:
  - path: /metrics
    exporters:
      http:
        - name: a
          address: {upstream}
"#
    ))
    .await;

    let plain = reqwest::get(format!("http://{addr}/metrics")).await.unwrap();
    assert_eq!(plain.status(), 404);

    let prefixed = reqwest::get(format!("http://{addr}/exporters/metrics"))
        .await
        .unwrap();
    assert_eq!(prefixed.status(), 200);
}
