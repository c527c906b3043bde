mod common;

use common::{SPEC, TestProject};
use infraflow_core::{FileStateStore, FlowState, Graph, InfraSpec, StateStore, StepOutput};
use predicates::prelude::*;

/// Seed a flow state in which only the network step succeeded
async fn seed_state(project: &TestProject) {
    let spec = InfraSpec::from_yaml_str(SPEC).unwrap();
    let graph = Graph::build(&spec, "shoot").unwrap();
    let mut state = FlowState::new("shoot");
    state.sync(graph.steps());
    state.record_success(
        "network/net-1",
        StepOutput::link(Some(
            "https://www.googleapis.com/compute/v1/projects/proj/global/networks/shoot-net-1"
                .to_string(),
        )),
        1,
    );
    FileStateStore::new(project.state_dir())
        .save(&state)
        .await
        .unwrap();
}

#[test]
fn test_cli_help() {
    let project = TestProject::new();
    project
        .command()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("plan"))
        .stdout(predicate::str::contains("reconcile"))
        .stdout(predicate::str::contains("delete"))
        .stdout(predicate::str::contains("status"));
}

#[test]
fn test_cli_version() {
    let project = TestProject::new();
    project
        .command()
        .arg("version")
        .assert()
        .success()
        .stdout(predicate::str::contains("infraflow"));
}

#[test]
fn test_reconcile_help() {
    let project = TestProject::new();
    project
        .command()
        .args(["reconcile", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--spec"))
        .stdout(predicate::str::contains("--instance"))
        .stdout(predicate::str::contains("--state-dir"))
        .stdout(predicate::str::contains("--json"));
}

#[test]
fn test_missing_spec_file() {
    let project = TestProject::new();
    project
        .command()
        .args(["status", "--spec", "nope.yaml", "--instance", "shoot"])
        .arg("--state-dir")
        .arg(project.state_dir())
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid spec"))
        .stderr(predicate::str::contains("ERR_CONFIGURATION_PROBLEM"));
}

#[test]
fn test_invalid_spec_is_rejected_before_credentials() {
    let project = TestProject::new();
    let spec = project.write_spec(
        r#"
project: proj
region: europe-west1
network: {name: net-1}
subnets:
  - {name: a, cidr: 10.0.0.0/16}
  - {name: b, cidr: 10.0.1.0/24}
"#,
    );

    project
        .command()
        .arg("plan")
        .arg("--spec")
        .arg(&spec)
        .args(["--instance", "shoot"])
        .arg("--state-dir")
        .arg(project.state_dir())
        .assert()
        .failure()
        .stderr(predicate::str::contains("ERR_CONFIGURATION_PROBLEM"))
        .stderr(predicate::str::contains("GOOGLE_CLOUD_ACCESS_TOKEN").not());
}

#[test]
fn test_plan_requires_credentials() {
    let project = TestProject::new();
    let spec = project.write_spec(SPEC);

    project
        .command()
        .arg("plan")
        .arg("--spec")
        .arg(&spec)
        .args(["--instance", "shoot"])
        .arg("--state-dir")
        .arg(project.state_dir())
        .assert()
        .failure()
        .stderr(predicate::str::contains("GOOGLE_CLOUD_ACCESS_TOKEN"));
}

#[test]
fn test_status_without_state() {
    let project = TestProject::new();
    let spec = project.write_spec(SPEC);

    project
        .command()
        .arg("status")
        .arg("--spec")
        .arg(&spec)
        .args(["--instance", "shoot"])
        .arg("--state-dir")
        .arg(project.state_dir())
        .assert()
        .success()
        .stdout(predicate::str::contains("No flow state"));
}

#[tokio::test]
async fn test_status_json_from_state() {
    let project = TestProject::new();
    let spec = project.write_spec(SPEC);
    seed_state(&project).await;

    project
        .command()
        .arg("status")
        .arg("--spec")
        .arg(&spec)
        .args(["--instance", "shoot", "--json"])
        .arg("--state-dir")
        .arg(project.state_dir())
        .assert()
        .success()
        .stdout(predicate::str::contains("\"kind\": \"InfrastructureStatus\""))
        .stdout(predicate::str::contains("\"name\": \"shoot-net-1\""))
        .stdout(predicate::str::contains("subnets").not());
}

#[tokio::test]
async fn test_state_lists_steps() {
    let project = TestProject::new();
    seed_state(&project).await;

    project
        .command()
        .args(["state", "--instance", "shoot"])
        .arg("--state-dir")
        .arg(project.state_dir())
        .assert()
        .success()
        .stdout(predicate::str::contains("network/net-1"))
        .stdout(predicate::str::contains("succeeded"))
        .stdout(predicate::str::contains("subnet/nodes"))
        .stdout(predicate::str::contains("pending"));
}

#[test]
fn test_instance_id_must_be_a_label() {
    let project = TestProject::new();
    let outside = project.root.path().join("x.json");

    for command in ["state", "delete"] {
        project
            .command()
            .args([command, "--instance", "../x"])
            .arg("--state-dir")
            .arg(project.state_dir())
            .assert()
            .failure()
            .stderr(predicate::str::contains("RFC 1035"));
    }
    assert!(!outside.exists());
    assert!(!project.state_dir().exists());
}
