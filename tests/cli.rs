use std::fs;
use std::path::Path;
use std::process::Command;
use tempfile::TempDir;

fn run_saathi(config_path: Option<&Path>, args: &[&str], env: &[(&str, &str)]) -> (String, String, bool) {
    let binary = env!("CARGO_BIN_EXE_saathi");
    let mut cmd = Command::new(binary);
    if let Some(path) = config_path {
        cmd.arg("--config").arg(path);
    }
    for key in ["PORT", "HOST", "NODE_ENV", "DISABLE_COMPRESSION", "CORS_ALLOWED_ORIGINS"] {
        cmd.env_remove(key);
    }
    let output = cmd
        .args(args)
        .envs(env.iter().copied())
        .output()
        .unwrap_or_else(|e| panic!("Failed to run saathi binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn setup_config(root: &Path) -> std::path::PathBuf {
    let dist = root.join("dist");
    fs::create_dir_all(&dist).unwrap();
    fs::write(dist.join("index.html"), "<html lang=\"en-US\"></html>").unwrap();

    let config_path = root.join("saathi.toml");
    fs::write(
        &config_path,
        format!(
            r#"[server]
host = "127.0.0.1"
port = 4100
environment = "production"

[client]
dist = "{}"

[cors]
allowed_origins = ["https://chat.example"]
"#,
            dist.display()
        ),
    )
    .unwrap();
    config_path
}

#[test]
fn check_reports_file_settings() {
    let tmp = TempDir::new().unwrap();
    let config = setup_config(tmp.path());

    let (stdout, stderr, ok) = run_saathi(Some(&config), &["check"], &[]);
    assert!(ok, "check failed: {}", stderr);
    assert!(stdout.contains("environment: production"), "{}", stdout);
    assert!(stdout.contains("listen:      127.0.0.1:4100"), "{}", stdout);
    assert!(stdout.contains("index.html:  present"), "{}", stdout);
    assert!(stdout.contains("cors:        https://chat.example"), "{}", stdout);
}

#[test]
fn environment_overrides_file() {
    let tmp = TempDir::new().unwrap();
    let config = setup_config(tmp.path());

    let (stdout, stderr, ok) = run_saathi(
        Some(&config),
        &["check"],
        &[("PORT", "5000"), ("DISABLE_COMPRESSION", "true")],
    );
    assert!(ok, "check failed: {}", stderr);
    assert!(stdout.contains("listen:      127.0.0.1:5000"), "{}", stdout);
    assert!(stdout.contains("compression: off"), "{}", stdout);
}

#[test]
fn runs_without_config_file() {
    let (stdout, stderr, ok) = run_saathi(None, &["check"], &[("HOST", "0.0.0.0")]);
    assert!(ok, "check failed: {}", stderr);
    assert!(stdout.contains("listen:      0.0.0.0:3080"), "{}", stdout);
    assert!(stdout.contains("environment: development"), "{}", stdout);
}

#[test]
fn invalid_config_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let config_path = tmp.path().join("bad.toml");
    fs::write(&config_path, "[init]\non_failure = \"sometimes\"\n").unwrap();

    let (_, stderr, ok) = run_saathi(Some(&config_path), &["check"], &[]);
    assert!(!ok);
    assert!(stderr.contains("on_failure"), "{}", stderr);
}

#[test]
fn out_of_range_port_fails_startup() {
    let (_, stderr, ok) = run_saathi(None, &["check"], &[("PORT", "70000")]);
    assert!(!ok);
    assert!(stderr.contains("PORT"), "{}", stderr);
}
