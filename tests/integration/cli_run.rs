//! End-to-end tests of the run, export and verify commands against a mock server

use clap::Parser;
use serde_json::json;
use std::path::Path;
use tempfile::TempDir;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use bulk_runner::cli::{Cli, CliError, Commands};
use bulk_runner::resume;
use bulk_runner::shutdown::ShutdownCoordinator;

fn cli(server: &MockServer, args: &[&str]) -> Cli {
    let uri = server.uri();
    let mut argv = vec![
        "bulk-runner",
        "--base-url",
        uri.as_str(),
        "--token",
        "test_token",
        "--output-format",
        "json",
    ];
    argv.extend_from_slice(args);
    Cli::parse_from(argv)
}

async fn execute(cli: &Cli) -> Result<(), CliError> {
    let shutdown = ShutdownCoordinator::shared();
    match &cli.command {
        Commands::Run(args) => args.execute(cli, shutdown).await,
        Commands::Export(args) => args.execute(cli, shutdown).await,
        Commands::Verify(args) => args.execute(cli).await,
    }
}

fn rows(path: &Path) -> Vec<Vec<String>> {
    let mut reader = csv::Reader::from_path(path).unwrap();
    reader
        .records()
        .map(|row| row.unwrap().iter().map(str::to_string).collect())
        .collect()
}

#[tokio::test]
async fn test_run_records_every_row_and_resumes() {
    let server = MockServer::start().await;
    for id in ["A-1", "A-3"] {
        Mock::given(method("POST"))
            .and(path(format!("/accounts/{id}/audit")))
            .and(header("authorization", "Bearer test_token"))
            .and(body_json(json!({"account": id, "full": true})))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;
    }
    Mock::given(method("POST"))
        .and(path("/accounts/A-2/audit"))
        .respond_with(ResponseTemplate::new(404).set_body_string("no such account"))
        .expect(1)
        .mount(&server)
        .await;

    let temp_dir = TempDir::new().unwrap();
    let input = temp_dir.path().join("accounts.csv");
    let output = temp_dir.path().join("out/results.csv");
    std::fs::write(&input, "account_id,owner\nA-1,ana\nA-2,bo\n,cy\nA-3,di\nA-1,ana\n").unwrap();

    let input_arg = input.display().to_string();
    let output_arg = output.display().to_string();
    let args = [
        "run",
        "--input",
        input_arg.as_str(),
        "--key-column",
        "account_id",
        "--method",
        "post",
        "--path",
        "/accounts/{key}/audit",
        "--body",
        r#"{"account": "{key}", "full": true}"#,
        "--output",
        output_arg.as_str(),
        "--max-attempts",
        "1",
    ];

    execute(&cli(&server, &args)).await.unwrap();

    let recorded = rows(&output);
    assert_eq!(recorded.len(), 4, "three keys plus the rejected row: {recorded:?}");
    let find = |key: &str| recorded.iter().find(|r| r[0] == key).cloned().unwrap();
    assert_eq!(find("A-1")[1], "SUCCESS");
    assert_eq!(find("A-3")[1], "SUCCESS");
    assert_eq!(find("A-2")[1], "ERROR");
    assert!(find("A-2")[2].contains("no such account"));
    assert_eq!(find("<row 3>")[1], "ERROR");
    assert_eq!(find("<row 3>")[4], "0");

    // Everything is recorded, so a rerun sends nothing (mock expectations hold)
    execute(&cli(&server, &args)).await.unwrap();
    assert_eq!(rows(&output).len(), 4);

    let verify = ["verify", "--output", output_arg.as_str()];
    execute(&cli(&server, &verify)).await.unwrap();
}

#[tokio::test]
async fn test_run_over_listed_items() {
    let server = MockServer::start().await;
    let pages = [
        ("0", json!({"data": [{"id": "u1"}, {"id": "u2"}]})),
        ("2", json!({"data": [{"id": "u3"}, {"name": "nameless"}]})),
        // Short page: u1 again, then the listing ends
        ("4", json!({"data": [{"id": "u1"}]})),
    ];
    for (offset, body) in pages {
        Mock::given(method("GET"))
            .and(path("/users"))
            .and(query_param("status", "inactive"))
            .and(query_param("offset", offset))
            .and(query_param("limit", "2"))
            .and(header("authorization", "Bearer test_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .expect(2)
            .mount(&server)
            .await;
    }
    for id in ["u1", "u2", "u3"] {
        Mock::given(method("DELETE"))
            .and(path(format!("/users/{id}")))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
    }

    let temp_dir = TempDir::new().unwrap();
    let output = temp_dir.path().join("deleted.csv");
    let output_arg = output.display().to_string();
    let args = [
        "run",
        "--list-path",
        "/users",
        "--list-query",
        "status=inactive",
        "--style",
        "offset",
        "--page-size",
        "2",
        "--items-pointer",
        "/data",
        "--key-pointer",
        "/id",
        "--method",
        "delete",
        "--path",
        "/users/{key}",
        "--output",
        output_arg.as_str(),
    ];

    execute(&cli(&server, &args)).await.unwrap();

    let recorded = rows(&output);
    assert_eq!(recorded.len(), 4, "three users plus the nameless item: {recorded:?}");
    let find = |key: &str| recorded.iter().find(|r| r[0] == key).cloned().unwrap();
    for id in ["u1", "u2", "u3"] {
        assert_eq!(find(id)[1], "SUCCESS");
    }
    assert_eq!(find("<item 4>")[1], "ERROR");
    assert!(find("<item 4>")[2].contains("/id"));
    assert_eq!(find("<item 4>")[4], "0");

    // The listing is walked again but nothing is deleted twice
    execute(&cli(&server, &args)).await.unwrap();
    assert_eq!(rows(&output).len(), 4);
}

#[tokio::test]
async fn test_run_reset_starts_over() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/items/k1"))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&server)
        .await;

    let temp_dir = TempDir::new().unwrap();
    let input = temp_dir.path().join("input.csv");
    let output = temp_dir.path().join("results.csv");
    std::fs::write(&input, "key\nk1\n").unwrap();

    let input_arg = input.display().to_string();
    let output_arg = output.display().to_string();
    let run = [
        "run",
        "--input",
        input_arg.as_str(),
        "--path",
        "/items/{key}",
        "--output",
        output_arg.as_str(),
    ];
    execute(&cli(&server, &run)).await.unwrap();

    let mut reset = run.to_vec();
    reset.extend_from_slice(&["--resume", "reset"]);
    execute(&cli(&server, &reset)).await.unwrap();

    assert_eq!(rows(&output).len(), 1);
}

#[tokio::test]
async fn test_run_unauthorized_fails() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad token"))
        .mount(&server)
        .await;

    let temp_dir = TempDir::new().unwrap();
    let input = temp_dir.path().join("input.csv");
    let output = temp_dir.path().join("results.csv");
    std::fs::write(&input, "key\nk1\nk2\nk3\n").unwrap();

    let input_arg = input.display().to_string();
    let output_arg = output.display().to_string();
    let result = execute(&cli(
        &server,
        &[
            "run",
            "--input",
            input_arg.as_str(),
            "--path",
            "/items/{key}",
            "--output",
            output_arg.as_str(),
            "--concurrency",
            "1",
        ],
    ))
    .await;

    assert!(matches!(
        result,
        Err(CliError::EngineError(bulk_runner::EngineError::Unauthorized(_)))
    ));
}

#[tokio::test]
async fn test_export_writes_all_pages() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users"))
        .and(query_param("status", "active"))
        .and(query_param("page_token", "p2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "users": [{"id": "u3", "email": "c@example.com"}, {"id": "u1", "email": "a@example.com"}],
            "next_page_token": ""
        })))
        .expect(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/users"))
        .and(query_param("status", "active"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "users": [
                {"id": "u1", "email": "a@example.com", "tags": ["x"]},
                {"id": "u2", "email": null}
            ],
            "next_page_token": "p2"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let temp_dir = TempDir::new().unwrap();
    let output = temp_dir.path().join("users.csv");
    let output_arg = output.display().to_string();

    execute(&cli(
        &server,
        &[
            "export",
            "--path",
            "/users",
            "--query",
            "status=active",
            "--style",
            "token",
            "--items-pointer",
            "/users",
            "--dedup-field",
            "id",
            "--output",
            output_arg.as_str(),
        ],
    ))
    .await
    .unwrap();

    let content = std::fs::read_to_string(&output).unwrap();
    let lines: Vec<_> = content.lines().collect();
    assert_eq!(lines[0], "email,id,tags");
    assert_eq!(lines[1], "a@example.com,u1,\"[\"\"x\"\"]\"");
    assert_eq!(lines[2], ",u2,");
    assert_eq!(lines[3], "c@example.com,u3,");
    assert_eq!(lines.len(), 4, "u1 on page two is a duplicate");
}

#[tokio::test]
async fn test_verify_rejects_damaged_file() {
    let server = MockServer::start().await;
    let temp_dir = TempDir::new().unwrap();
    let output = temp_dir.path().join("results.csv");
    std::fs::write(
        &output,
        "key,status,message,timestamp,attempts\n\
         k1,SUCCESS,,2024-01-01 00:00:00,1\n\
         k1,ERROR,HTTP 500,2024-01-01 00:00:01,3\n\
         k2,DONE,,2024-01-01 00:00:02,1\n",
    )
    .unwrap();

    let output_arg = output.display().to_string();
    let verify = ["verify", "--output", output_arg.as_str()];
    assert!(execute(&cli(&server, &verify)).await.is_err());

    let scanned = resume::scan(&output).unwrap();
    assert_eq!(scanned.duplicates, 1);
    assert_eq!(scanned.malformed, 1);

    let missing = temp_dir.path().join("missing.csv").display().to_string();
    let verify_missing = ["verify", "--output", missing.as_str()];
    assert!(matches!(
        execute(&cli(&server, &verify_missing)).await,
        Err(CliError::InvalidArgument(_))
    ));
}
