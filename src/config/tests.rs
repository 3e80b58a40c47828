//! Unit tests for deployment file parsing and environment resolution.

use super::*;
use rstest::{fixture, rstest};
use tempfile::TempDir;

const SAMPLE: &str = r#"
[environments.dev]
server = "10.0.0.5:2222"
username = "deploy"
password = "secret"
java_path = "/opt/java/bin/java"
remote_base_path = "/opt/apps"
jar_files = ["admin.jar", "client.jar"]
scripts = "build:dev"
output_dir = "dist-dev"

[environments.prod]
server = "prod.example.com"
username = "deploy"
identity_file = "/keys/prod"
java_path = "/usr/bin/java"
remote_base_path = "/srv/www"
jar_files = ["app.jar"]
scripts = "build"
output_dir = "dist"
"#;

#[fixture]
fn deploy_file() -> DeployFile {
    DeployFile::from_toml(Utf8Path::new("deploy.toml"), SAMPLE).expect("sample should parse")
}

#[rstest]
fn resolve_builds_target_with_port(deploy_file: DeployFile) {
    let target = deploy_file
        .resolve("dev", &TargetOverrides::default(), Flow::Server)
        .expect("dev should resolve");

    assert_eq!(target.environment, "dev");
    assert_eq!(target.endpoint.host, "10.0.0.5");
    assert_eq!(target.endpoint.port, 2222);
    assert_eq!(target.endpoint.username, "deploy");
    assert_eq!(
        target.endpoint.credential,
        Credential::Password(String::from("secret"))
    );
    assert_eq!(target.artifacts, ["admin.jar", "client.jar"]);
    assert_eq!(target.runtime_path, "/opt/java/bin/java");
}

#[rstest]
fn resolve_prefers_identity_file(deploy_file: DeployFile) {
    let target = deploy_file
        .resolve("prod", &TargetOverrides::default(), Flow::Bundle)
        .expect("prod should resolve");

    assert_eq!(target.endpoint.port, DEFAULT_SSH_PORT);
    assert_eq!(
        target.endpoint.credential,
        Credential::IdentityFile(Utf8PathBuf::from("/keys/prod"))
    );
    assert_eq!(target.output_dir, "dist");
}

#[rstest]
fn resolve_rejects_unknown_environment(deploy_file: DeployFile) {
    let err = deploy_file
        .resolve("staging", &TargetOverrides::default(), Flow::Server)
        .expect_err("staging is not defined");
    assert_eq!(err, ConfigError::UnknownEnvironment(String::from("staging")));
}

#[rstest]
fn overrides_replace_fields(deploy_file: DeployFile) {
    let overrides = TargetOverrides {
        server: Some(String::from("override-host:2200")),
        password: Some(String::from("other")),
        remote_base_path: Some(String::from("/tmp/apps")),
        ..TargetOverrides::default()
    };
    let target = deploy_file
        .resolve("dev", &overrides, Flow::Server)
        .expect("dev should resolve");

    assert_eq!(target.endpoint.host, "override-host");
    assert_eq!(target.endpoint.port, 2200);
    assert_eq!(
        target.endpoint.credential,
        Credential::Password(String::from("other"))
    );
    assert_eq!(target.remote_base_path, "/tmp/apps");
    assert_eq!(target.runtime_path, "/opt/java/bin/java");
}

#[test]
fn server_flow_requires_java_path_but_bundle_flow_does_not() {
    let contents = r#"
[environments.web]
server = "web:22"
username = "u"
password = "p"
remote_base_path = "/srv"
scripts = "build"
output_dir = "dist"
"#;
    let file = DeployFile::from_toml(Utf8Path::new("deploy.toml"), contents).expect("parse");

    let err = file
        .resolve("web", &TargetOverrides::default(), Flow::Server)
        .expect_err("server flow needs java_path");
    assert_eq!(
        err,
        ConfigError::MissingField {
            environment: String::from("web"),
            field: "java_path",
        }
    );
    assert!(
        file.resolve("web", &TargetOverrides::default(), Flow::Bundle)
            .is_ok()
    );
}

#[test]
fn resolve_requires_a_credential() {
    let contents = r#"
[environments.dev]
server = "host"
username = "u"
java_path = "/bin/java"
remote_base_path = "/srv"
jar_files = ["a.jar"]
"#;
    let file = DeployFile::from_toml(Utf8Path::new("deploy.toml"), contents).expect("parse");
    let err = file
        .resolve("dev", &TargetOverrides::default(), Flow::Server)
        .expect_err("credential is required");
    assert_eq!(err, ConfigError::MissingCredential(String::from("dev")));
}

#[test]
fn malformed_file_reports_parse_error() {
    let err = DeployFile::from_toml(Utf8Path::new("deploy.toml"), "environments = 3")
        .expect_err("wrong shape should fail");
    assert!(matches!(err, ConfigError::Parse { .. }));
}

#[rstest]
#[case("host", Some(("host", 22)))]
#[case("host:2200", Some(("host", 2200)))]
#[case("192.168.31.60:22", Some(("192.168.31.60", 22)))]
#[case("[::1]:2022", Some(("::1", 2022)))]
#[case("[fe80::1]", Some(("fe80::1", 22)))]
#[case("fe80::1", Some(("fe80::1", 22)))]
#[case("host:notaport", None)]
#[case(":22", None)]
#[case("", None)]
fn parse_address_handles_forms(#[case] input: &str, #[case] expected: Option<(&str, u16)>) {
    let parsed = parse_address(input);
    assert_eq!(
        parsed,
        expected.map(|(host, port)| (host.to_owned(), port))
    );
}

#[test]
fn debug_output_redacts_passwords() {
    let config = EnvironmentConfig {
        password: String::from("hunter2"),
        ..EnvironmentConfig::default()
    };
    let rendered = format!("{config:?}");
    assert!(!rendered.contains("hunter2"), "password leaked: {rendered}");
}

#[test]
fn write_sample_creates_three_environments_and_refuses_overwrite() {
    let tmp = TempDir::new().expect("temp dir");
    let path = Utf8PathBuf::from_path_buf(tmp.path().join("nested").join("deploy.toml"))
        .expect("utf8 path");

    write_sample(&path, false).expect("sample should be written");
    let loaded = DeployFile::load(&path).expect("sample should load");
    let names: Vec<_> = loaded.environments.keys().map(String::as_str).collect();
    assert_eq!(names, ["dev", "prod", "test"]);
    assert_eq!(loaded, DeployFile::sample());

    let err = write_sample(&path, false).expect_err("second write should be refused");
    assert_eq!(err, ConfigError::Exists(path.clone()));
    write_sample(&path, true).expect("forced write should succeed");
}

#[test]
fn resolve_environment_reports_missing_file() {
    let tmp = TempDir::new().expect("temp dir");
    let path = Utf8PathBuf::from_path_buf(tmp.path().join("absent.toml")).expect("utf8 path");
    let err = resolve_environment(&path, "dev", &TargetOverrides::default(), Flow::Server)
        .expect_err("missing file should fail");
    assert!(matches!(err, ConfigError::Read { .. }));
}
