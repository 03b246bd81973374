#![allow(clippy::unwrap_used, clippy::expect_used)]
//! End-to-end capture against a local HTTP server.

use std::collections::BTreeSet;
use std::sync::Arc;

use pagestash_core::{
    ArchiveReader, CaptureOrchestrator, Config, Error, HeadlessSurface, PipelineStage,
    ResourceKey, SurfaceUpdate,
};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config(root: &TempDir) -> Config {
    let mut config = Config::default();
    config.paths.root = root.path().to_path_buf();
    config.capture.quiet_period_ms = 100;
    config.capture.capture_timeout_secs = 20;
    config
}

async fn serve(server: &MockServer, at: &str, status: u16, content_type: &str, body: &[u8]) {
    Mock::given(method("GET"))
        .and(path(at))
        .respond_with(ResponseTemplate::new(status).set_body_raw(body.to_vec(), content_type))
        .mount(server)
        .await;
}

async fn sample_site() -> MockServer {
    let server = MockServer::start().await;
    serve(
        &server,
        "/article",
        200,
        "text/html; charset=utf-8",
        br#"<!doctype html>
<html>
  <head>
    <title>Local &amp; Live</title>
    <link rel="stylesheet" href="/static/site.css">
  </head>
  <body>
    <img src="/static/hero.jpg">
    <img src="/static/broken.png">
    <script src="/static/app.js"></script>
  </body>
</html>"#,
    )
    .await;
    serve(
        &server,
        "/static/site.css",
        200,
        "text/css",
        b"@font-face { src: url(fonts/body.woff2); } body { background: url('/static/paper.png'); }",
    )
    .await;
    serve(&server, "/static/fonts/body.woff2", 200, "font/woff2", b"wOF2").await;
    serve(&server, "/static/paper.png", 200, "image/png", b"\x89PNG paper").await;
    serve(&server, "/static/hero.jpg", 200, "image/jpeg", b"\xff\xd8 hero").await;
    serve(&server, "/static/app.js", 200, "application/javascript", b"console.log(1)").await;
    serve(&server, "/static/broken.png", 500, "text/plain", b"boom").await;
    server
}

#[tokio::test]
async fn capture_load_and_project_a_page() {
    let server = sample_site().await;
    let root = TempDir::new().unwrap();
    let orchestrator = CaptureOrchestrator::from_config(config(&root)).unwrap();
    let surface = Arc::new(HeadlessSurface::new("main"));

    let outcome = orchestrator
        .start_capture(&format!("{}/article", server.uri()), surface.clone())
        .await
        .unwrap();

    let result = &outcome.result;
    assert_eq!(result.title.as_deref(), Some("Local & Live"));
    assert_eq!(result.resource_count, 6);
    assert_eq!(result.failed_count, 1);
    assert_eq!(
        result.archive_path,
        root.path().join("stash").join("Local___Live.pgz")
    );

    // The failed resource is left out, everything else resolves from the archive.
    let handle = surface.bound_archive().expect("archive bound to surface");
    assert!(handle.resolve("static/broken.png").is_none());
    let font = handle.resolve("/static/fonts/body.woff2").unwrap();
    assert_eq!(handle.read(font).await.unwrap(), b"wOF2");
    let document = handle.document().unwrap();
    assert!(
        String::from_utf8(handle.read(document).await.unwrap())
            .unwrap()
            .contains("Local &amp; Live")
    );

    let manifest = ArchiveReader::open(&result.archive_path)
        .unwrap()
        .manifest()
        .clone();
    assert_eq!(manifest.failures.len(), 1);
    assert!(manifest.failures[0].url.ends_with("/static/broken.png"));

    assert!(matches!(
        surface.updates().last(),
        Some(SurfaceUpdate::Completed { resource_count: 6, .. })
    ));
}

#[tokio::test]
async fn archive_index_matches_cache_generation() {
    let server = sample_site().await;
    let root = TempDir::new().unwrap();
    let orchestrator = CaptureOrchestrator::from_config(config(&root)).unwrap();

    let outcome = orchestrator
        .start_capture(
            &format!("{}/article", server.uri()),
            Arc::new(HeadlessSurface::new("main")),
        )
        .await
        .unwrap();

    let generation = orchestrator
        .cache_store()
        .finished_generation(outcome.result.generation)
        .expect("generation retained");
    let cached: BTreeSet<ResourceKey> = generation.keys().into_iter().collect();
    let indexed: BTreeSet<ResourceKey> = outcome.archive.resource_index().keys().cloned().collect();
    assert_eq!(cached, indexed);

    // Loading the same file again reuses the loaded archive.
    let again = orchestrator
        .loader()
        .load(&outcome.result.archive_path)
        .await
        .unwrap();
    assert!(Arc::ptr_eq(&again, &outcome.archive));
    assert_eq!(orchestrator.loader().unpack_count(), 1);
}

#[tokio::test]
async fn unreachable_page_fails_in_capture_stage() {
    let server = MockServer::start().await;
    serve(&server, "/gone", 404, "text/html", b"not here").await;
    let root = TempDir::new().unwrap();
    let orchestrator = CaptureOrchestrator::from_config(config(&root)).unwrap();
    let surface = Arc::new(HeadlessSurface::new("main"));

    let err = orchestrator
        .start_capture(&format!("{}/gone", server.uri()), surface.clone())
        .await
        .unwrap_err();

    assert_eq!(err.pipeline_stage(), Some(PipelineStage::Capture));
    assert!(matches!(err.root(), Error::Navigation { .. }));
    assert!(surface.bound_archive().is_none());
    assert_eq!(
        std::fs::read_dir(root.path().join("stash")).unwrap().count(),
        0,
        "no archive written"
    );
}
