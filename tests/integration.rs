use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;
use wiremock::matchers::{body_partial_json, body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn mrqa_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("mrqa");
    path
}

fn setup_test_env(model_url: &str) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    // Corpus: two categories, three documents
    let corpus = root.join("corpus");
    fs::create_dir_all(corpus.join("空家")).unwrap();
    fs::create_dir_all(corpus.join("補助金")).unwrap();
    fs::write(
        corpus.join("空家").join("000_空家等対策の推進に関する特別措置法.txt"),
        "第二条 この法律において「管理不全空家等」とは、空家等が適切な管理が行われていないことによりそのまま放置すれば特定空家等に該当することとなるおそれのある状態にあると認められる空家等をいう。",
    )
    .unwrap();
    fs::write(
        corpus.join("補助金").join("001_交付要綱.txt"),
        "第一条 この要綱は、補助金の交付に関し必要な事項を定める。",
    )
    .unwrap();
    fs::write(
        corpus.join("補助金").join("002_実施要領.txt"),
        "第三条 補助対象経費は別表に定める。",
    )
    .unwrap();

    let config_content = format!(
        r#"[corpus]
root = "{root}/corpus"
include_globs = ["**/*.txt"]

[model]
url = "{url}"
name = "test-model"
timeout_secs = 30
max_retries = 0

[runs]
dir = "{root}/run"

[dispatch]
parallelism = 2
"#,
        root = root.display(),
        url = model_url,
    );

    let config_path = config_dir.join("mrqa.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

/// Run the binary; returns (stdout, stderr, exit code).
fn run_mrqa(config_path: &Path, args: &[&str]) -> (String, String, i32) {
    let output = Command::new(mrqa_binary())
        .arg("--config")
        .arg(config_path)
        .args(args)
        .env_remove("OLLAMA_HOST")
        .env_remove("OLLAMA_MODEL")
        .env_remove("OLLAMA_NUM_CTX")
        .env_remove("OLLAMA_NUM_PREDICT")
        .env_remove("RUST_LOG")
        .output()
        .expect("Failed to execute mrqa binary");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.code().unwrap_or(-1))
}

/// `run_mrqa` off the async runtime so the mock server keeps serving.
async fn run_mrqa_async(config_path: &Path, args: &[&str]) -> (String, String, i32) {
    let config_path = config_path.to_path_buf();
    let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
    tokio::task::spawn_blocking(move || {
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        run_mrqa(&config_path, &args)
    })
    .await
    .unwrap()
}

async fn mount_tags(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "models": [{ "name": "test-model:latest" }]
        })))
        .mount(server)
        .await;
}

async fn mount_generate(server: &MockServer) {
    // Reduce prompts first; everything else is a map prompt.
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .and(body_string_contains("複数の行政文書から"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "response": "統合回答: 管理不全空家等は特措法第二条に定義されています。",
            "done": true,
            "prompt_eval_count": 400,
            "eval_count": 30
        })))
        .with_priority(1)
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "response": "文書の記載によれば、管理不全空家等とは放置すれば特定空家等になるおそれのある空家等です。",
            "done": true,
            "prompt_eval_count": 900,
            "eval_count": 40
        })))
        .mount(server)
        .await;
}

async fn mock_ollama() -> MockServer {
    let server = MockServer::start().await;
    mount_tags(&server).await;
    mount_generate(&server).await;
    server
}

fn only_run_id(config_path: &Path) -> String {
    let (stdout, _, code) = run_mrqa(config_path, &["runs", "--json"]);
    assert_eq!(code, 0);
    let runs: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    let runs = runs.as_array().unwrap();
    assert_eq!(runs.len(), 1);
    runs[0]["run_id"].as_str().unwrap().to_string()
}

#[test]
fn test_templates_lists_builtins() {
    let (_tmp, config_path) = setup_test_env("http://127.0.0.1:9");
    let (stdout, _, code) = run_mrqa(&config_path, &["templates"]);
    assert_eq!(code, 0);
    for name in ["baseline", "sandwich", "structured", "consensus", "compare"] {
        assert!(stdout.contains(name), "missing {}: {}", name, stdout);
    }

    let (stdout, _, code) = run_mrqa(&config_path, &["templates", "--role", "aggregate"]);
    assert_eq!(code, 0);
    assert!(stdout.contains("consensus"));
    assert!(!stdout.contains("baseline"));
}

#[test]
fn test_stats_counts_documents() {
    let (_tmp, config_path) = setup_test_env("http://127.0.0.1:9");
    let (stdout, _, code) = run_mrqa(&config_path, &["stats"]);
    assert_eq!(code, 0);
    assert!(stdout.contains("Documents:   3"), "stdout: {}", stdout);
    assert!(stdout.contains("空家"));
    assert!(stdout.contains("補助金"));

    let (stdout, _, code) = run_mrqa(&config_path, &["stats", "--subdir", "補助金", "--json"]);
    assert_eq!(code, 0);
    let stats: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(stats["document_count"], 2);
}

#[test]
fn test_index_numbers_documents() {
    let (_tmp, config_path) = setup_test_env("http://127.0.0.1:9");
    let (stdout, _, code) = run_mrqa(&config_path, &["index", "--json"]);
    assert_eq!(code, 0);
    let docs: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    let docs = docs.as_array().unwrap();
    assert_eq!(docs.len(), 3);
    assert_eq!(docs[0]["id"], 1);
    assert_eq!(docs[0]["category"], "空家");
    assert_eq!(docs[2]["id"], 3);

    let (stdout, _, code) = run_mrqa(&config_path, &["index", "--show-hash"]);
    assert_eq!(code, 0);
    assert!(stdout.contains("HASH"));
    assert!(stdout.contains("001"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_check_reports_missing_model() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "models": [{ "name": "other-model:latest" }]
        })))
        .mount(&server)
        .await;

    let (_tmp, config_path) = setup_test_env(&server.uri());
    let (_, stderr, code) = run_mrqa_async(&config_path, &["check"]).await;
    assert_eq!(code, 4, "stderr: {}", stderr);
    assert!(stderr.contains("test-model"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_check_ok() {
    let server = mock_ollama().await;
    let (_tmp, config_path) = setup_test_env(&server.uri());
    let (stdout, _, code) = run_mrqa_async(&config_path, &["check"]).await;
    assert_eq!(code, 0);
    assert!(stdout.contains("OK"));
    assert!(stdout.contains("test-model"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_ask_single_document() {
    let server = mock_ollama().await;
    let (_tmp, config_path) = setup_test_env(&server.uri());
    let (stdout, stderr, code) = run_mrqa_async(
        &config_path,
        &["ask", "1", "管理不全空家等の定義は何ですか？", "--json"],
    )
    .await;
    assert_eq!(code, 0, "stderr: {}", stderr);
    let record: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(record["success"], true);
    assert_eq!(record["document_id"], 1);
    assert_eq!(record["category"], "空家");
    assert!(record["answer"].as_str().unwrap().contains("管理不全空家等"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_ask_model_overrides_reach_the_endpoint() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "models": [{ "name": "test-model:latest" }, { "name": "other-model:latest" }]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .and(body_partial_json(serde_json::json!({
            "model": "other-model",
            "options": { "num_ctx": 4096, "num_predict": 128 }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "response": "別モデルの回答",
            "done": true,
            "prompt_eval_count": 1000,
            "eval_count": 24
        })))
        .expect(1)
        .mount(&server)
        .await;

    let (_tmp, config_path) = setup_test_env(&server.uri());
    let (stdout, stderr, code) = run_mrqa_async(
        &config_path,
        &[
            "ask", "1", "定義は？", "--json",
            "-m", "other-model", "-c", "4096", "--num-predict", "128",
        ],
    )
    .await;
    assert_eq!(code, 0, "stderr: {}", stderr);
    let record: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(record["model"], "other-model");
    assert_eq!(record["metrics"]["num_ctx"], 4096);
    assert_eq!(record["metrics"]["total_tokens"], 1024);
    assert_eq!(record["metrics"]["remaining_tokens"], 3072);
    assert_eq!(record["metrics"]["context_usage_percent"], 25.0);
}

#[test]
fn test_num_predict_zero_is_config_error() {
    let (_tmp, config_path) = setup_test_env("http://127.0.0.1:9");
    let (_, stderr, code) = run_mrqa(&config_path, &["ask", "1", "q", "--num-predict", "0"]);
    assert_eq!(code, 2, "stderr: {}", stderr);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_run_then_aggregate_again() {
    let server = mock_ollama().await;
    let (tmp, config_path) = setup_test_env(&server.uri());

    let (stdout, stderr, code) = run_mrqa_async(
        &config_path,
        &["run", "管理不全空家等の定義は何ですか？", "--progress", "off"],
    )
    .await;
    assert_eq!(code, 0, "stderr: {}", stderr);
    assert!(stdout.contains("統合回答"));
    assert!(stderr.contains("3 ok"));

    let run_id = only_run_id(&config_path);
    let run_dir = tmp.path().join("run").join(&run_id);
    assert!(run_dir.join("metadata.json").exists());
    // one JSON record and one text report per document
    assert_eq!(fs::read_dir(run_dir.join("single_qa")).unwrap().count(), 6);
    let report = fs::read_to_string(
        run_dir
            .join("single_qa")
            .join("001_空家_000_空家等対策の推進に関する特別措置法.txt"),
    )
    .unwrap();
    assert!(report.contains("900 prompt + 40 completion = 940"));
    assert!(run_dir.join("aggregates").join("001_consensus.json").exists());
    assert!(run_dir.join("aggregates").join("001_consensus.txt").exists());

    let (stdout, stderr, code) = run_mrqa_async(
        &config_path,
        &["aggregate", &run_id, "--template", "compare", "--json"],
    )
    .await;
    assert_eq!(code, 0, "stderr: {}", stderr);
    let result: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(result["sequence"], 2);
    assert_eq!(result["template"], "compare");
    assert!(run_dir.join("aggregates").join("002_compare.json").exists());
    assert_eq!(fs::read_dir(run_dir.join("single_qa")).unwrap().count(), 6);

    let (stdout, _, code) = run_mrqa_async(&config_path, &["show", &run_id, "--json"]).await;
    assert_eq!(code, 0);
    let shown: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(shown["metadata"]["status"], "completed");
    assert_eq!(shown["record_count"], 3);
    assert_eq!(shown["latest_aggregate"]["template"], "compare");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_template_exits_before_model_calls() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let (tmp, config_path) = setup_test_env(&server.uri());
    let (_, stderr, code) = run_mrqa_async(
        &config_path,
        &["run", "q", "--aggregate-template", "nope", "--progress", "off"],
    )
    .await;
    assert_eq!(code, 3, "stderr: {}", stderr);
    assert!(stderr.contains("nope"));
    assert!(stderr.contains("consensus"));
    assert!(!tmp.path().join("run").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_all_documents_failing_exits_no_usable_records() {
    let server = MockServer::start().await;
    mount_tags(&server).await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let (_tmp, config_path) = setup_test_env(&server.uri());
    let (_, stderr, code) = run_mrqa_async(
        &config_path,
        &["run", "q", "--run-id", "all-fail", "--progress", "off"],
    )
    .await;
    assert_eq!(code, 8, "stderr: {}", stderr);

    let (stdout, _, code) = run_mrqa_async(&config_path, &["show", "all-fail", "--json"]).await;
    assert_eq!(code, 0);
    let shown: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(shown["metadata"]["status"], "failed");
    assert_eq!(shown["record_count"], 3);
    assert!(shown["latest_aggregate"].is_null());
}

#[test]
fn test_aggregate_unknown_run() {
    let (_tmp, config_path) = setup_test_env("http://127.0.0.1:9");
    let (_, stderr, code) = run_mrqa(&config_path, &["aggregate", "2020-01-01_0001"]);
    assert_eq!(code, 9, "stderr: {}", stderr);
}

#[test]
fn test_runs_empty() {
    let (_tmp, config_path) = setup_test_env("http://127.0.0.1:9");
    let (stdout, _, code) = run_mrqa(&config_path, &["runs"]);
    assert_eq!(code, 0);
    assert!(stdout.contains("No runs"));
}
