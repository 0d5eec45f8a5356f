//! Model management, cancellation and construction against mocked servers.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{lm, ndjson, ndjson_response, sse, sse_response};
use locallm::{GenerationParameters, InferenceHooks, InferenceOptions, LoadOptions, Lm, LmError, LmParams, ProviderKind};
use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// ─── Cancellation ────────────────────────────────────────────────────────────

async fn abort_delayed(kind: ProviderKind, endpoint: &str, server: &MockServer) -> Result<locallm::InferenceResult, LmError> {
    Mock::given(method("POST"))
        .and(path(endpoint))
        .respond_with(
            sse_response(sse(&[json!({"content": "late", "stop": true})])).set_delay(Duration::from_secs(10)),
        )
        .mount(server)
        .await;

    let lm = Arc::new(lm(kind, server));
    let task = {
        let lm = lm.clone();
        tokio::spawn(async move {
            let mut hooks = InferenceHooks::new();
            lm.infer("x", &GenerationParameters::streaming(), &InferenceOptions::default(), &mut hooks)
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(200)).await;
    lm.abort().await;
    lm.abort().await;
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("abort did not resolve the call")
        .unwrap()
}

#[tokio::test]
async fn test_abort_resolves_pending_call() {
    let server = MockServer::start().await;
    let err = abort_delayed(ProviderKind::LlamaCpp, "/completion", &server)
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
}

#[tokio::test]
async fn test_koboldcpp_abort_notifies_server() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/extra/abort"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": "true"})))
        .expect(1)
        .mount(&server)
        .await;

    let err = abort_delayed(ProviderKind::KoboldCpp, "/api/extra/generate/stream", &server)
        .await
        .unwrap_err();
    assert!(matches!(err, LmError::Cancelled));
}

#[tokio::test]
async fn test_abort_after_completion_is_noop() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/completion"))
        .respond_with(sse_response(sse(&[json!({"content": "Mercury", "stop": true})])))
        .mount(&server)
        .await;

    let lm = lm(ProviderKind::LlamaCpp, &server);
    let params = GenerationParameters::streaming();
    let first = lm
        .infer("x", &params, &InferenceOptions::default(), &mut InferenceHooks::new())
        .await
        .unwrap();
    assert_eq!(first.text, "Mercury");

    lm.abort().await;
    lm.abort().await;

    let second = lm
        .infer("x", &params, &InferenceOptions::default(), &mut InferenceHooks::new())
        .await
        .unwrap();
    assert_eq!(second.text, "Mercury");
}

#[tokio::test]
async fn test_koboldcpp_abort_after_completion_stays_local() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/extra/generate/stream"))
        .respond_with(sse_response(sse(&[
            json!({"token": "Mercury", "finish_reason": null}),
            json!({"token": "", "finish_reason": "stop"}),
        ])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/extra/abort"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": "true"})))
        .expect(0)
        .mount(&server)
        .await;

    let lm = lm(ProviderKind::KoboldCpp, &server);
    let result = lm
        .infer("x", &GenerationParameters::streaming(), &InferenceOptions::default(), &mut InferenceHooks::new())
        .await
        .unwrap();
    assert_eq!(result.text, "Mercury");

    lm.abort().await;
    server.verify().await;
}

// ─── Construction ────────────────────────────────────────────────────────────

#[test]
fn test_hosted_backends_require_key() {
    let err = Lm::new(LmParams::new(ProviderKind::OpenAi, "https://api.openai.com/v1"))
        .err()
        .unwrap();
    assert!(matches!(err, LmError::MissingCredential { provider: "openai" }));
}

#[tokio::test]
async fn test_chat_backend_without_model() {
    let lm = Lm::new(LmParams::new(ProviderKind::OpenAi, "http://127.0.0.1:9").with_api_key("sk-test")).unwrap();
    let err = lm
        .infer("x", &GenerationParameters::default(), &InferenceOptions::default(), &mut InferenceHooks::new())
        .await
        .unwrap_err();
    assert!(matches!(err, LmError::NoModelSelected { .. }));
}

#[tokio::test]
async fn test_from_config_file() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .and(body_partial_json(json!({"model": "llama3.1:8b", "options": {"temperature": 0.5, "num_ctx": 8192}})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"response": "ok", "done": true})))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("locallm.yaml");
    let yaml = format!(
        "providers:\n  local:\n    provider: ollama\n    server_url: {}\n    model: llama3.1:8b\n    context_length: 8192\n    defaults:\n      temperature: 0.5\n",
        server.uri()
    );
    std::fs::write(&file, yaml).unwrap();

    let lm = Lm::from_config_file(&file, None).unwrap();
    assert_eq!(lm.kind(), ProviderKind::Ollama);
    let params = lm.defaults().clone();
    let result = lm
        .infer("x", &params, &InferenceOptions::default(), &mut InferenceHooks::new())
        .await
        .unwrap();
    assert_eq!(result.text, "ok");
}

// ─── Model management ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_ollama_pull_reports_progress() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/show"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({"error": "model not found"})))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/show"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "parameters": "num_ctx                        8192",
            "details": {"parameter_size": "8.0B", "quantization_level": "Q4_K_M"}
        })))
        .mount(&server)
        .await;
    let lines = [
        json!({"status": "pulling manifest"}),
        json!({"status": "pulling 6a0746a1ec1a", "digest": "sha256:6a07", "total": 400, "completed": 100}),
        json!({"status": "pulling 6a0746a1ec1a", "digest": "sha256:6a07", "total": 400, "completed": 400}),
        json!({"status": "success"}),
    ];
    Mock::given(method("POST"))
        .and(path("/api/pull"))
        .and(body_partial_json(json!({"name": "llama3.1:8b", "stream": true})))
        .respond_with(ndjson_response(ndjson(&lines)))
        .expect(1)
        .mount(&server)
        .await;

    let lm = lm(ProviderKind::Ollama, &server);
    let mut seen = Vec::new();
    lm.load_model("llama3.1:8b", LoadOptions::default().with_progress(|p| seen.push(p.clone())))
        .await
        .unwrap();

    assert_eq!(seen.first().map(|p| p.status.as_str()), Some("pulling manifest"));
    assert_eq!(seen.last().map(|p| p.status.as_str()), Some("success"));

    let model = lm.model();
    assert_eq!(model.name, "llama3.1:8b");
    assert_eq!(model.context_length, Some(8192));
    assert_eq!(model.info.unwrap().quantization, "Q4_K_M");
}

#[tokio::test]
async fn test_ollama_truncated_pull_keeps_excerpt() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/show"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({"error": "model not found"})))
        .mount(&server)
        .await;
    let mut body = ndjson(&[json!({"status": "pulling manifest"})]);
    body.push_str(r#"{"status": "pulling 6a07", "total": 400, "comp"#);
    Mock::given(method("POST"))
        .and(path("/api/pull"))
        .respond_with(ndjson_response(body))
        .mount(&server)
        .await;

    let lm = lm(ProviderKind::Ollama, &server);
    let mut seen = 0;
    let err = lm
        .load_model("llama3.1:8b", LoadOptions::default().with_progress(|_| seen += 1))
        .await
        .unwrap_err();
    match err {
        LmError::MalformedResponse { ref payload, .. } => assert!(payload.contains("pulling 6a07")),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(seen, 1);
}

#[tokio::test]
async fn test_ollama_missing_model_without_pull() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/show"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let lm = lm(ProviderKind::Ollama, &server);
    let err = lm.load_model("nope:latest", LoadOptions::default()).await.unwrap_err();
    assert!(matches!(err, LmError::ModelNotFound { ref name, .. } if name == "nope:latest"));
}

#[tokio::test]
async fn test_ollama_list_models() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"models": [
            {"name": "llama3.1:8b", "details": {"parameter_size": "8.0B", "quantization_level": "Q4_K_M"}},
            {"name": "qwen2.5:0.5b"}
        ]})))
        .mount(&server)
        .await;

    let models = lm(ProviderKind::Ollama, &server).list_models().await.unwrap();
    assert_eq!(models.len(), 2);
    assert_eq!(models[0].info.as_ref().unwrap().param_size, "8.0B");
    assert!(models[1].info.is_none());
}

#[tokio::test]
async fn test_koboldcpp_load_verifies_served_model() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/model"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": "koboldcpp/Mistral-7B-Instruct"})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/extra/true_max_context_length"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": 4096})))
        .mount(&server)
        .await;

    let lm = lm(ProviderKind::KoboldCpp, &server);
    lm.load_model("Mistral-7B-Instruct", LoadOptions::default()).await.unwrap();
    assert_eq!(lm.model().name, "koboldcpp/Mistral-7B-Instruct");
    assert_eq!(lm.model().context_length, Some(4096));

    let err = lm.load_model("llama3", LoadOptions::default()).await.unwrap_err();
    assert!(matches!(err, LmError::ModelNotFound { .. }));
    assert_eq!(lm.model().name, "koboldcpp/Mistral-7B-Instruct");
}

#[tokio::test]
async fn test_llamacpp_info_and_listing_fallback() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/props"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "default_generation_settings": {"n_ctx": 4096},
            "model_path": "/models/qwen2.5-7b-instruct-q4_k_m.gguf"
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/models"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let lm = lm(ProviderKind::LlamaCpp, &server);
    let info = lm.info().await.unwrap();
    assert_eq!(info.name, "qwen2.5-7b-instruct-q4_k_m.gguf");
    assert_eq!(info.context_length, Some(4096));

    let models = lm.list_models().await.unwrap();
    assert_eq!(models, vec![info]);

    lm.load_model("", LoadOptions::default().with_context(2048)).await.unwrap();
    assert_eq!(lm.model().context_length, Some(2048));
}

#[tokio::test]
async fn test_llamacpp_info_without_model_is_malformed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/props"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "default_generation_settings": {"n_ctx": 8_589_934_592u64}
        })))
        .mount(&server)
        .await;

    let lm = lm(ProviderKind::LlamaCpp, &server);
    let err = lm.info().await.unwrap_err();
    match err {
        LmError::MalformedResponse { ref payload, .. } => assert!(payload.contains("n_ctx")),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_llamacpp_listing_ignores_oversized_context() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                {"id": "big.gguf", "meta": {"n_ctx_train": 8_589_934_592u64}},
                {"id": "small.gguf", "meta": {"n_ctx_train": 4096}}
            ]
        })))
        .mount(&server)
        .await;

    let lm = lm(ProviderKind::LlamaCpp, &server);
    let models = lm.list_models().await.unwrap();
    assert_eq!(models[0].name, "big.gguf");
    assert_eq!(models[0].context_length, None);
    assert_eq!(models[1].context_length, Some(4096));
}

#[tokio::test]
async fn test_goinfer_models_and_load() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/model/state"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "models": {
                "mistral-7b": {"name": "chatml", "ctx": 4096},
                "llama-3-8b": {"name": "llama3", "ctx": 8192}
            },
            "isModelLoaded": false,
            "loadedModel": ""
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/model/load"))
        .and(body_partial_json(json!({"name": "mistral-7b", "ctx": 4096})))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/model/load"))
        .and(body_partial_json(json!({"name": "unknown"})))
        .respond_with(ResponseTemplate::new(404).set_body_string("model not found"))
        .mount(&server)
        .await;

    let lm = lm(ProviderKind::Goinfer, &server);
    let names: Vec<_> = lm.list_models().await.unwrap().into_iter().map(|m| m.name).collect();
    assert_eq!(names, ["llama-3-8b", "mistral-7b"]);

    assert!(matches!(lm.info().await, Err(LmError::NoModelSelected { .. })));

    lm.load_model("mistral-7b", LoadOptions::default()).await.unwrap();
    assert_eq!(lm.model().context_length, Some(4096));

    let err = lm.load_model("unknown", LoadOptions::default()).await.unwrap_err();
    assert!(matches!(err, LmError::ModelNotFound { .. }));
}

#[tokio::test]
async fn test_openai_models() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"object": "list", "data": [
            {"id": "gpt-4o-mini", "object": "model", "owned_by": "openai"},
            {"id": "o3-mini", "object": "model"}
        ]})))
        .mount(&server)
        .await;

    let lm = lm(ProviderKind::OpenAi, &server);
    let models = lm.list_models().await.unwrap();
    assert_eq!(models[0].name, "gpt-4o-mini");
    assert_eq!(models[1].name, "o3-mini");
    assert!(matches!(lm.info().await, Err(LmError::NotImplemented { .. })));

    lm.load_model("o3-mini", LoadOptions::default()).await.unwrap();
    assert_eq!(lm.model().name, "o3-mini");
}
