use assert_cmd::Command;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

pub const SPEC: &str = r#"
project: proj
region: europe-west1
network: {name: net-1}
subnets:
  - {name: nodes, cidr: 10.250.0.0/16}
"#;

pub struct TestProject {
    pub root: TempDir,
}

impl TestProject {
    pub fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        Self { root }
    }

    pub fn write_spec(&self, content: &str) -> PathBuf {
        let path = self.root.path().join("spec.yaml");
        fs::write(&path, content).unwrap();
        path
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.path().join("state")
    }

    /// The CLI isolated from the caller's settings and credentials
    pub fn command(&self) -> Command {
        #[allow(deprecated)]
        let mut cmd = Command::cargo_bin("infraflow").unwrap();
        cmd.current_dir(self.root.path())
            .env("INFRAFLOW_CONFIG_PATH", self.root.path().join("missing.yaml"))
            .env_remove("INFRAFLOW_STATE_DIR")
            .env_remove("INFRAFLOW_MAX_CONCURRENCY")
            .env_remove("INFRAFLOW_SPEC")
            .env_remove("INFRAFLOW_INSTANCE")
            .env_remove("GOOGLE_CLOUD_ACCESS_TOKEN");
        cmd
    }
}
