//! End-to-end tests: each test starts the service on an ephemeral port under
//! its own temporary root and talks to it over HTTP.

use std::{io::Cursor, net::SocketAddr, path::Path};

use classifier_service_rs::{
    app,
    artifact::{self, DEFAULT_MANIFEST_NAME},
    network::{Activation, Layer, Sequential, TrainingConfig, INPUT_SHAPE},
    Config,
};
use image::{DynamicImage, ImageBuffer, ImageOutputFormat, Rgb};
use rand::{rngs::StdRng, SeedableRng};
use reqwest::{
    multipart::{Form, Part},
    StatusCode,
};
use serde_json::Value;
use tempfile::TempDir;

struct TestServer {
    base: String,
    root: TempDir,
    client: reqwest::Client,
}

impl TestServer {
    async fn start() -> Self {
        let root = tempfile::tempdir().unwrap();
        let config = Config::with_root(root.path());
        let server = axum::Server::bind(&SocketAddr::from(([127, 0, 0, 1], 0)))
            .serve(app(config).into_make_service());
        let base = format!("http://{}", server.local_addr());
        tokio::spawn(server);
        TestServer {
            base,
            root,
            client: reqwest::Client::new(),
        }
    }

    fn config(&self) -> Config {
        Config::with_root(self.root.path())
    }

    async fn predict(&self, form: Form) -> (StatusCode, Value) {
        let response = self
            .client
            .post(format!("{}/predict", self.base))
            .multipart(form)
            .send()
            .await
            .unwrap();
        let status = response.status();
        (status, response.json().await.unwrap())
    }

    async fn train(&self) -> (StatusCode, Value) {
        let response = self
            .client
            .post(format!("{}/train", self.base))
            .send()
            .await
            .unwrap();
        let status = response.status();
        (status, response.json().await.unwrap())
    }

    fn upload_count(&self) -> usize {
        match std::fs::read_dir(self.config().uploads_dir) {
            Ok(entries) => entries.count(),
            Err(_) => 0,
        }
    }
}

fn png_bytes(width: u32, height: u32, pixel: [u8; 3]) -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(ImageBuffer::from_pixel(width, height, Rgb(pixel)))
        .write_to(&mut out, ImageOutputFormat::Png)
        .unwrap();
    out.into_inner()
}

fn file_form(name: &str, bytes: Vec<u8>) -> Form {
    Form::new().part("file", Part::bytes(bytes).file_name(name.to_string()))
}

/// A single softmax layer over the full input, small enough to write quickly.
fn save_small_model(dir: &Path) {
    let mut rng = StdRng::seed_from_u64(5);
    let inputs = INPUT_SHAPE.iter().product();
    let layers = vec![
        Layer::Flatten {
            name: "flatten_1".into(),
        },
        Layer::dense(&mut rng, "dense_1", inputs, 3, Activation::Softmax),
    ];
    let model = Sequential::new(
        "small",
        INPUT_SHAPE.to_vec(),
        layers,
        Sequential::default_labels(),
        TrainingConfig::default(),
    )
    .unwrap();
    artifact::save(&model, dir, DEFAULT_MANIFEST_NAME).unwrap();
}

fn assert_probabilities(body: &Value) {
    let rows = body["prediction"].as_array().unwrap();
    assert_eq!(rows.len(), 1);
    let row = rows[0].as_array().unwrap();
    assert_eq!(row.len(), 3);
    let sum: f64 = row.iter().map(|p| p.as_f64().unwrap()).sum();
    assert!((sum - 1.0).abs() < 1e-4, "probabilities sum to {sum}");
    assert_eq!(
        body["class_labels"],
        serde_json::json!(["class1", "class2", "class3"])
    );
}

#[tokio::test]
async fn health_reports_ok() {
    let server = TestServer::start().await;
    let body: Value = reqwest::get(format!("{}/health", server.base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body, serde_json::json!({ "status": "OK" }));
}

#[tokio::test]
async fn index_embeds_sample_history() {
    let server = TestServer::start().await;
    let response = reqwest::get(format!("{}/", server.base)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let page = response.text().await.unwrap();
    assert!(page.contains(r#""val_accuracy":[0.75,0.8,0.85]"#));
    assert!(page.contains(r#""test_loss":[0.5,0.4,0.35]"#));
    assert!(!page.contains("{{history}}"));
}

#[tokio::test]
async fn predict_without_file_is_400_and_writes_nothing() {
    let server = TestServer::start().await;
    let form = Form::new().text("note", "no file here");
    let (status, body) = server.predict(form).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "No file uploaded");
    assert_eq!(server.upload_count(), 0);
}

#[tokio::test]
async fn predict_with_non_multipart_body_is_400() {
    let server = TestServer::start().await;
    let response = server
        .client
        .post(format!("{}/predict", server.base))
        .body("plain text")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "No file uploaded");
}

#[tokio::test]
async fn disallowed_extension_is_400_before_model_lookup() {
    // no model exists, so reaching the registry would give 404
    let server = TestServer::start().await;
    let (status, body) = server
        .predict(file_form("cat.gif", png_bytes(4, 4, [0, 0, 0])))
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Invalid file type");
    assert_eq!(server.upload_count(), 0);
}

#[tokio::test]
async fn predict_without_model_is_404() {
    let server = TestServer::start().await;
    let (status, body) = server
        .predict(file_form("cat.png", png_bytes(4, 4, [10, 20, 30])))
        .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "No model files found");
}

#[tokio::test]
async fn predict_returns_probabilities_and_stores_upload() {
    let server = TestServer::start().await;
    save_small_model(&server.config().model_dir);

    let (status, body) = server
        .predict(file_form("White.PNG", png_bytes(500, 500, [255, 255, 255])))
        .await;

    assert_eq!(status, StatusCode::OK, "{body}");
    assert_probabilities(&body);

    let stored: Vec<_> = std::fs::read_dir(server.config().uploads_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(stored.len(), 1);
    assert!(stored[0].ends_with("-White.PNG"));
}

#[tokio::test]
async fn same_image_twice_gives_same_prediction() {
    let server = TestServer::start().await;
    save_small_model(&server.config().model_dir);
    let image = png_bytes(31, 77, [12, 200, 99]);

    let (_, first) = server.predict(file_form("a.png", image.clone())).await;
    let (_, second) = server.predict(file_form("b.png", image)).await;
    assert_eq!(first["prediction"], second["prediction"]);
}

#[tokio::test]
async fn undecodable_image_is_500_with_detail() {
    let server = TestServer::start().await;
    save_small_model(&server.config().model_dir);

    let (status, body) = server
        .predict(file_form("broken.jpg", b"not really a jpeg".to_vec()))
        .await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"]
        .as_str()
        .unwrap()
        .starts_with("Error processing image: "));
}

#[tokio::test]
async fn corrupt_model_is_500_with_detail() {
    let server = TestServer::start().await;
    let model_dir = server.config().model_dir;
    std::fs::create_dir_all(&model_dir).unwrap();
    std::fs::write(model_dir.join("model.json"), b"{\"format\":").unwrap();

    let (status, body) = server
        .predict(file_form("cat.jpeg", png_bytes(8, 8, [1, 2, 3])))
        .await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"]
        .as_str()
        .unwrap()
        .starts_with("Error loading model: "));
}

#[tokio::test]
async fn train_saves_a_servable_model_and_overwrites() {
    let server = TestServer::start().await;
    let manifest = server.config().model_dir.join(DEFAULT_MANIFEST_NAME);

    let (status, body) = server.train().await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Model trained and saved successfully");
    assert!(manifest.is_file());

    let (status, body) = server
        .predict(file_form("white.png", png_bytes(64, 64, [255, 255, 255])))
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_probabilities(&body);

    let (status, _) = server.train().await;
    assert_eq!(status, StatusCode::OK);
    assert!(manifest.is_file());
    let manifests = std::fs::read_dir(server.config().model_dir)
        .unwrap()
        .filter(|e| {
            e.as_ref()
                .unwrap()
                .file_name()
                .to_string_lossy()
                .ends_with(".json")
        })
        .count();
    assert_eq!(manifests, 1);
}
