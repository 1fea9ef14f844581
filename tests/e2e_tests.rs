//! End-to-end tests for the manyshot-eval CLI

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;
use wiremock::matchers::{body_partial_json, body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Completion body with the full answer template for questions 1 and 2, so
/// it counts as complete for every batch size used here.
fn completion_content() -> String {
    let mut content = String::new();
    for qn in 1..=2 {
        content.push_str(&format!(
            "---BEGIN FORMAT TEMPLATE FOR QUESTION {qn}---\n\
Answer Choice {qn}: no finding\n\
Confidence Score {qn}: 0.9\n\
---END FORMAT TEMPLATE FOR QUESTION {qn}---\n"
        ));
    }
    content
}

fn mock_chat_completion_response() -> serde_json::Value {
    serde_json::json!({
        "id": "chatcmpl-123",
        "object": "chat.completion",
        "created": 1677652288,
        "model": "test-model",
        "choices": [{
            "index": 0,
            "message": {
                "role": "assistant",
                "content": completion_content()
            },
            "finish_reason": "stop"
        }],
        "usage": {
            "prompt_tokens": 10,
            "completion_tokens": 20,
            "total_tokens": 30
        }
    })
}

/// Writes the CSV and image fixtures for a 2-class dataset with a 2-row demo
/// pool and a 5-row test set.
struct Fixture {
    data: TempDir,
    out: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let data = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();

        fs::write(
            data.path().join("demo.csv"),
            ",Pneumonia,No_Finding\nd1.png,1,0\nd2.png,0,1\n",
        )
        .unwrap();
        fs::write(
            data.path().join("test.csv"),
            ",Pneumonia,No_Finding\nt1.png,1,0\nt2.png,0,1\nt3.png,1,0\nt4.png,0,1\nt5.png,1,0\n",
        )
        .unwrap();
        fs::write(
            data.path().join("demographics.csv"),
            "updated_path,binary_race\n/archive/demo/d1.png,White\n/archive/demo/d2.png,White\n",
        )
        .unwrap();

        let demo_dir = data.path().join("images").join("demo");
        let test_dir = data.path().join("images").join("test");
        fs::create_dir_all(&demo_dir).unwrap();
        fs::create_dir_all(&test_dir).unwrap();
        for id in ["d1.png", "d2.png"] {
            fs::write(demo_dir.join(id), b"\x89PNG\r\nstub").unwrap();
        }
        for id in ["t1.png", "t2.png", "t3.png", "t4.png", "t5.png"] {
            fs::write(test_dir.join(id), b"\x89PNG\r\nstub").unwrap();
        }

        Self { data, out }
    }

    fn command(&self, base_url: &str) -> Command {
        self.command_with_shots(base_url, 1)
    }

    fn command_with_shots(&self, base_url: &str, shots_per_class: usize) -> Command {
        let model_args = format!("model=test-model,base_url={}/v1", base_url);
        let shots = shots_per_class.to_string();
        let mut cmd = Command::cargo_bin("manyshot-eval").unwrap();
        cmd.args([
            "--demo-csv",
            self.data.path().join("demo.csv").to_str().unwrap(),
            "--test-csv",
            self.data.path().join("test.csv").to_str().unwrap(),
            "--demographics-csv",
            self.data.path().join("demographics.csv").to_str().unwrap(),
            "--images",
            self.data.path().join("images").to_str().unwrap(),
            "--demo-subdir",
            "demo",
            "--test-subdir",
            "test",
            "--dataset-name",
            "chexpert",
            "--model-args",
            model_args.as_str(),
            "--shots-per-class",
            shots.as_str(),
            "--split",
            "0.0",
            "--batch-size",
            "2",
            "--class-descriptions",
            "pneumonia present,no finding",
            "--out-dir",
            self.out.path().to_str().unwrap(),
        ]);
        cmd
    }

    fn checkpoint_path(&self) -> std::path::PathBuf {
        self.out
            .path()
            .join("chexpert_2shot_test-model_2_0.00split.json")
    }

    fn results_table_path(&self) -> std::path::PathBuf {
        self.out.path().join("chexpert_test-model_2_results.csv")
    }
}

fn read_summary(output: &std::process::Output) -> serde_json::Value {
    let stdout = String::from_utf8_lossy(&output.stdout);
    serde_json::from_str(&stdout).expect("stdout should be the JSON run summary")
}

fn read_checkpoint(path: &Path) -> serde_json::Value {
    serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
}

#[tokio::test]
async fn test_full_run_writes_checkpoint_and_results_table() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(serde_json::json!({ "model": "test-model" })))
        .and(body_string_contains("data:image/png;base64"))
        .respond_with(ResponseTemplate::new(200).set_body_json(mock_chat_completion_response()))
        .expect(3)
        .mount(&mock_server)
        .await;

    let fixture = Fixture::new();
    let output = fixture
        .command(&mock_server.uri())
        .output()
        .expect("Failed to execute command");
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let summary = read_summary(&output);
    assert_eq!(summary["batches"], 3);
    assert_eq!(summary["succeeded"], 3);
    assert_eq!(summary["failed"], 0);
    assert_eq!(summary["calls_made"], 3);
    assert_eq!(summary["token_usage"]["total_tokens"], 90);

    let checkpoint = read_checkpoint(&fixture.checkpoint_path());
    assert_eq!(checkpoint["results"].as_object().unwrap().len(), 3);
    assert_eq!(checkpoint["token_usage"]["prompt_tokens"], 30);

    let results = fs::read_to_string(fixture.results_table_path()).unwrap();
    assert!(results.starts_with("num_shots_per_class,black_race_split,accuracy"));
    assert_eq!(results.lines().count(), 1, "header only, zero rows");
}

#[tokio::test]
async fn test_resume_skips_completed_batches() {
    let first_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(mock_chat_completion_response()))
        .expect(3)
        .mount(&first_server)
        .await;

    let fixture = Fixture::new();
    fixture.command(&first_server.uri()).assert().success();

    // Complete checkpoint entries mean zero calls on the second run.
    let second_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(mock_chat_completion_response()))
        .expect(0)
        .mount(&second_server)
        .await;

    let output = fixture
        .command(&second_server.uri())
        .output()
        .expect("Failed to execute command");
    assert!(output.status.success());

    let summary = read_summary(&output);
    assert_eq!(summary["skipped"], 3);
    assert_eq!(summary["calls_made"], 0);
    // Zero delta folded in; cumulative usage unchanged.
    assert_eq!(summary["token_usage"]["total_tokens"], 90);
}

#[tokio::test]
async fn test_api_failure_is_error_marked_and_run_survives() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream exploded"))
        .expect(9) // 3 batches x 3 attempts
        .mount(&mock_server)
        .await;

    let fixture = Fixture::new();
    let output = fixture
        .command(&mock_server.uri())
        .output()
        .expect("Failed to execute command");
    // Transient failures are recorded, not fatal.
    assert!(output.status.success());

    let summary = read_summary(&output);
    assert_eq!(summary["failed"], 3);
    assert_eq!(summary["calls_made"], 9);

    let checkpoint = read_checkpoint(&fixture.checkpoint_path());
    for (_, value) in checkpoint["results"].as_object().unwrap() {
        let value = value.as_str().unwrap();
        assert!(value.starts_with("ERROR!!!!"), "entry not error-marked: {value}");
        assert!(value.contains("upstream exploded"));
    }
}

#[tokio::test]
async fn test_unsatisfiable_sampling_aborts_before_any_call() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(mock_chat_completion_response()))
        .expect(0)
        .mount(&mock_server)
        .await;

    let fixture = Fixture::new();
    // Each class has a single eligible demo row.
    let mut cmd = fixture.command_with_shots(&mock_server.uri(), 3);

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("insufficient demo pool"));
}

#[test]
fn test_missing_required_args() {
    let mut cmd = Command::cargo_bin("manyshot-eval").unwrap();
    cmd.args(["--dataset-name", "chexpert"]);
    cmd.assert().failure();
}

#[test]
fn test_help_flag() {
    let mut cmd = Command::cargo_bin("manyshot-eval").unwrap();
    cmd.arg("--help");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("--shots-per-class"))
        .stdout(predicate::str::contains("--model-args"))
        .stdout(predicate::str::contains("--split"));
}
