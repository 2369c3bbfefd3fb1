use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use recollex::{HashingEncoder, Recollex};
use serde_json::Value;
use server::{router, AppState};
use std::sync::Arc;
use tempfile::{tempdir, TempDir};
use tower::ServiceExt;

const DIMS: usize = 1 << 20;

fn build_tiny_index(dir: &TempDir) -> Arc<Recollex> {
    let index = Recollex::open_with_encoder(dir.path().join("idx"), HashingEncoder::new(DIMS).unwrap()).unwrap();
    index.add("Rust is great. rust systems programming, rust", Some("doc-a".into())).unwrap();
    index.add("Learning rust and python", Some("doc-b".into())).unwrap();
    index.add("Gardening in spring", Some("doc-c".into())).unwrap();
    Arc::new(index)
}

fn app(index: Arc<Recollex>) -> Router {
    router(AppState { index, admin_token: Some("secret".into()) })
}

async fn call(app: Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = app.oneshot(req).await.unwrap();
    let status = resp.status();
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    let json = if body.is_empty() { Value::Null } else { serde_json::from_slice(&body).unwrap_or(Value::Null) };
    (status, json)
}

fn get(uri: &str) -> Request<Body> { Request::get(uri).body(Body::empty()).unwrap() }

fn post_json(uri: &str, body: Value, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::post(uri).header("content-type", "application/json");
    if let Some(t) = token {
        builder = builder.header("X-ADMIN-TOKEN", t);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

#[tokio::test]
async fn search_returns_ranked_results() {
    let dir = tempdir().unwrap();
    let index = build_tiny_index(&dir);

    let (status, json) = call(app(index), get("/search?q=rust&k=5")).await;
    assert_eq!(status, StatusCode::OK);
    let arr = json["results"].as_array().unwrap();
    assert_eq!(arr.len(), 2);
    assert_eq!(arr[0]["doc_id"].as_u64().unwrap(), 1);
    assert_eq!(arr[1]["doc_id"].as_u64().unwrap(), 2);
    assert_eq!(arr[0]["payload"], "doc-a");
}

#[tokio::test]
async fn stopword_only_query_is_empty_not_an_error() {
    let dir = tempdir().unwrap();
    let (status, json) = call(app(build_tiny_index(&dir)), get("/search?q=the")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["total_hits"], 0);
}

#[tokio::test]
async fn vector_search_and_validation() {
    let dir = tempdir().unwrap();
    let index = build_tiny_index(&dir);
    let doc = index.get(3).unwrap().unwrap();
    let (ids, weights): (Vec<u32>, Vec<f32>) = doc.vector.iter().unzip();

    let (status, json) =
        call(app(index.clone()), post_json("/search", serde_json::json!({ "ids": ids, "weights": weights }), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["results"][0]["doc_id"], 3);

    let bad = serde_json::json!({ "ids": [DIMS + 1], "weights": [1.0] });
    let (status, _) = call(app(index), post_json("/search", bad, None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn doc_lookup() {
    let dir = tempdir().unwrap();
    let index = build_tiny_index(&dir);
    let (status, json) = call(app(index.clone()), get("/doc/2")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["payload"], "doc-b");
    let (status, _) = call(app(index), get("/doc/99")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn admin_batch_requires_token() {
    let dir = tempdir().unwrap();
    let index = build_tiny_index(&dir);
    let batch = serde_json::json!([{ "text": "tokio async runtime", "payload": "doc-d" }]);

    let (status, _) = call(app(index.clone()), post_json("/index/batch", batch.clone(), Some("wrong"))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, json) = call(app(index.clone()), post_json("/index/batch", batch, Some("secret"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["added"], serde_json::json!([4]));

    let (status, _) = call(app(index.clone()), post_json("/index/commit", Value::Null, Some("secret"))).await;
    assert_eq!(status, StatusCode::OK);

    let (_, json) = call(app(index), get("/search?q=tokio")).await;
    assert_eq!(json["results"][0]["payload"], "doc-d");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_searches_then_closed_index() {
    let dir = tempdir().unwrap();
    let index = build_tiny_index(&dir);
    let app = app(index.clone());

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let app = app.clone();
            tokio::spawn(async move { call(app, get("/search?q=rust&k=5")).await })
        })
        .collect();
    for handle in handles {
        let (status, json) = handle.await.unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["total_hits"], 2);
    }

    index.close().unwrap();
    let (status, _) = call(app.clone(), get("/search?q=rust")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let (status, _) = call(app, post_json("/search", serde_json::json!({ "ids": [1], "weights": [1.0] }), None)).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}
