//! Step catalogs for every operation kind: the ordered commands, their skip
//! predicates and which failure signal governs each step. Everything that
//! reaches a shell is validated before interpolation.

use berth_domain::{steps, Host, JobKind, Site};

use crate::{FailureSignal, PipelineDefinition, PipelineError, SkipWhen, StepSpec};

const UPSTREAM_DIR: &str = "/etc/nginx/berth/upstreams";
const DEFAULT_APP_PORT: u16 = 8080;

#[derive(Debug, Clone)]
pub struct ProvisionParams {
    pub db_host: String,
    pub db_name: String,
    pub db_user: String,
    pub db_password: String,
    pub admin_password: String,
    pub apps: Vec<String>,
}

pub fn provision_definition(
    site: &Site,
    bench: &Host,
    params: &ProvisionParams,
) -> Result<PipelineDefinition, PipelineError> {
    validate_site_name(&site.name)?;
    validate_bench(bench)?;
    validate_db_host(&params.db_host)?;
    validate_identifier("db name", &params.db_name)?;
    validate_identifier("db user", &params.db_user)?;
    validate_secret("db password", &params.db_password)?;
    validate_secret("admin password", &params.admin_password)?;
    for app in &params.apps {
        validate_identifier("app", app)?;
    }

    let d = &bench.bench_dir;
    let b = &bench.bench_bin;
    let s = &site.name;

    let mut create_site = vec![format!(
        "cd -- {d} && {b} new-site --db-name {} --mariadb-root-username {} \
         --mariadb-root-password {} --admin-password {} {s} --force",
        params.db_name, params.db_user, params.db_password, params.admin_password
    )];
    for app in &params.apps {
        create_site.push(format!("cd -- {d} && {b} --site {s} install-app {app} --run-patches"));
    }
    create_site.push(format!("cd -- {d} && {b} --site {s} migrate --skip-failing"));

    Ok(PipelineDefinition::new(
        JobKind::Provision,
        vec![
            StepSpec::new(
                steps::UPDATE_APPS,
                [format!("cd -- {d} && {b} update --pull --requirements --no-backup")],
            )
            .signal(FailureSignal::Stderr),
            StepSpec::new(
                steps::CONFIGURE_DATABASE,
                [
                    format!("cd -- {d} && {b} set-config -g db_host {}", params.db_host),
                    format!(
                        "mysql -h {} -P 3306 -u {} -p{} -e \"CREATE DATABASE {};\"",
                        params.db_host, params.db_user, params.db_password, params.db_name
                    ),
                ],
            ),
            StepSpec::new(
                steps::DISABLE_DEV_WATCHER,
                [format!("sed -i 's/^watch:/# watch:/' -- {d}/Procfile")],
            )
            .skip_when(SkipWhen::InProduction),
            StepSpec::new(
                steps::ENABLE_SERVICE_AUTOSTART,
                [
                    "systemctl enable bench-start.service".to_string(),
                    "systemctl start bench-start.service".to_string(),
                ],
            )
            .skip_when(SkipWhen::InProduction),
            StepSpec::new(
                steps::SETUP_PRODUCTION,
                [format!("cd -- {d} && {b} setup production {} --yes", bench.user)],
            )
            .skip_when(SkipWhen::OutsideProduction),
            StepSpec::new(steps::CREATE_SITE, create_site).signal(FailureSignal::Stderr),
            StepSpec::new(
                steps::SET_DEVELOPER_MODE,
                [
                    format!("cd -- {d} && {b} set-config -g developer_mode 1"),
                    format!("cd -- {d} && {b} clear-cache"),
                ],
            )
            .skip_when(SkipWhen::InProduction)
            .non_fatal(),
            StepSpec::new(
                steps::RESTART_SERVICES,
                ["systemctl restart bench-start.service".to_string()],
            )
            .skip_when(SkipWhen::InProduction),
            StepSpec::new(
                steps::REMOVE_FAIL2BAN,
                ["apt-get remove --auto-remove fail2ban --yes".to_string()],
            )
            .skip_when(SkipWhen::OutsideProduction)
            .non_fatal(),
            StepSpec::new(
                steps::RUN_INITIAL_SETUP,
                [format!("cd -- {d} && {b} --site {s} run-initial-setup --force")],
            )
            .signal(FailureSignal::Stderr),
        ],
    ))
}

pub fn update_definition(site: &Site, bench: &Host) -> Result<PipelineDefinition, PipelineError> {
    validate_site_name(&site.name)?;
    validate_bench(bench)?;

    let d = &bench.bench_dir;
    let b = &bench.bench_bin;
    let s = &site.name;

    Ok(PipelineDefinition::new(
        JobKind::Update,
        vec![
            StepSpec::new(
                steps::ENABLE_MAINTENANCE_MODE,
                [
                    format!("cd -- {d} && {b} --site {s} set-maintenance-mode on"),
                    format!("cd -- {d} && {b} clear-cache"),
                ],
            )
            .signal(FailureSignal::Stderr),
            StepSpec::new(
                steps::PULL_CHANGES,
                [format!("cd -- {d} && {b} update --pull --no-backup")],
            )
            .signal(FailureSignal::Stderr),
            StepSpec::new(steps::BUILD_ASSETS, [format!("cd -- {d} && {b} build")])
                .signal(FailureSignal::Stderr),
            StepSpec::new(
                steps::MIGRATE_SITE,
                [format!("cd -- {d} && {b} --site {s} migrate")],
            )
            .signal(FailureSignal::Stderr),
            StepSpec::new(steps::RESTART_SERVICES, [format!("cd -- {d} && {b} restart")])
                .skip_when(SkipWhen::OutsideProduction),
            StepSpec::new(
                steps::DISABLE_MAINTENANCE_MODE,
                [
                    format!("cd -- {d} && {b} --site {s} set-maintenance-mode off"),
                    format!("cd -- {d} && {b} clear-cache"),
                ],
            )
            .signal(FailureSignal::Stderr),
        ],
    ))
}

pub fn register_upstream_definition(
    site: &Site,
    bench: &Host,
) -> Result<PipelineDefinition, PipelineError> {
    validate_site_name(&site.name)?;
    let server_name = site.host_name.as_deref().unwrap_or(&site.name);
    validate_site_name(server_name)?;

    let config = render_upstream_config(server_name, &bench.address);
    let conf_path = upstream_conf_path(&site.name);

    Ok(PipelineDefinition::new(
        JobKind::RegisterUpstream,
        vec![
            StepSpec::new(
                steps::ADD_SITE_TO_UPSTREAM,
                [
                    format!("mkdir -p {UPSTREAM_DIR}"),
                    build_upstream_write_command(&conf_path, &config),
                    "nginx -t".to_string(),
                ],
            ),
            StepSpec::new(steps::RELOAD_UPSTREAM, ["nginx -s reload".to_string()]),
        ],
    ))
}

pub fn remove_upstream_definition(site: &Site) -> Result<PipelineDefinition, PipelineError> {
    validate_site_name(&site.name)?;
    let conf_path = upstream_conf_path(&site.name);
    Ok(PipelineDefinition::new(
        JobKind::RemoveUpstream,
        vec![
            StepSpec::new(
                steps::REMOVE_SITE_FROM_UPSTREAM,
                [format!("rm -f -- {conf_path}")],
            ),
            StepSpec::new(steps::RELOAD_UPSTREAM, ["nginx -s reload".to_string()]),
        ],
    ))
}

pub fn rename_definition(
    site: &Site,
    bench: &Host,
    new_name: &str,
) -> Result<PipelineDefinition, PipelineError> {
    validate_site_name(&site.name)?;
    validate_site_name(new_name)?;
    validate_bench(bench)?;

    let d = &bench.bench_dir;

    Ok(PipelineDefinition::new(
        JobKind::Rename,
        vec![StepSpec::new(
            steps::RENAME_SITE,
            [
                format!("cd -- {d}/sites && test -d -- {}", site.name),
                format!("cd -- {d}/sites && mv -- {} {}", site.name, new_name),
            ],
        )],
    )
    .with_data(serde_json::json!({ "new_name": new_name })))
}

pub fn rename_upstream_definition(
    site: &Site,
    bench: &Host,
    new_name: &str,
) -> Result<PipelineDefinition, PipelineError> {
    validate_site_name(&site.name)?;
    validate_site_name(new_name)?;

    let config = render_upstream_config(new_name, &bench.address);
    let old_conf = upstream_conf_path(&site.name);
    let new_conf = upstream_conf_path(new_name);

    Ok(PipelineDefinition::new(
        JobKind::RenameUpstream,
        vec![
            StepSpec::new(
                steps::RENAME_SITE_ON_UPSTREAM,
                [
                    format!("mkdir -p {UPSTREAM_DIR}"),
                    build_upstream_write_command(&new_conf, &config),
                    format!("rm -f -- {old_conf}"),
                    "nginx -t".to_string(),
                ],
            ),
            StepSpec::new(steps::RELOAD_UPSTREAM, ["nginx -s reload".to_string()]),
        ],
    )
    .with_data(serde_json::json!({ "new_name": new_name })))
}

pub fn archive_definition(site: &Site, bench: &Host) -> Result<PipelineDefinition, PipelineError> {
    validate_site_name(&site.name)?;
    validate_bench(bench)?;
    let d = &bench.bench_dir;
    let b = &bench.bench_bin;
    Ok(PipelineDefinition::new(
        JobKind::Archive,
        vec![StepSpec::new(
            steps::ARCHIVE_SITE,
            [format!("cd -- {d} && {b} drop-site {} --no-backup --force", site.name)],
        )],
    ))
}

pub fn move_definition(
    site: &Site,
    bench: &Host,
    target: &Host,
) -> Result<PipelineDefinition, PipelineError> {
    validate_site_name(&site.name)?;
    validate_bench(bench)?;
    validate_bench(target)?;
    let d = &bench.bench_dir;
    let b = &bench.bench_bin;
    Ok(PipelineDefinition::new(
        JobKind::MoveToBench,
        vec![StepSpec::new(
            steps::MOVE_SITE,
            [format!(
                "cd -- {d} && {b} move-site {} --target {}:{}",
                site.name, target.address, target.bench_dir
            )],
        )],
    )
    .with_data(serde_json::json!({ "target": target.id })))
}

pub fn upstream_conf_path(site: &str) -> String {
    format!("{UPSTREAM_DIR}/{site}.conf")
}

pub fn render_upstream_config(server_name: &str, bench_address: &str) -> String {
    let mut output = String::new();
    output.push_str("server {\n");
    output.push_str("    listen 80;\n");
    output.push_str(&format!("    server_name {server_name};\n"));
    output.push_str("    location / {\n");
    output.push_str(&format!(
        "        proxy_pass http://{bench_address}:{DEFAULT_APP_PORT};\n"
    ));
    output.push_str("        proxy_set_header Host $host;\n");
    output.push_str("        proxy_set_header X-Forwarded-For $remote_addr;\n");
    output.push_str("    }\n");
    output.push_str("}\n");
    output
}

fn build_upstream_write_command(path: &str, contents: &str) -> String {
    let delimiter = "BERTH_UPSTREAM_EOF";
    format!("cat <<'{delimiter}' > {path}\n{contents}\n{delimiter}")
}

fn invalid(message: String) -> PipelineError {
    PipelineError::InvalidDefinition { message }
}

pub fn validate_site_name(name: &str) -> Result<(), PipelineError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(invalid("site name is empty".to_string()));
    }
    if trimmed != name {
        return Err(invalid("site name contains whitespace".to_string()));
    }
    if name.starts_with(['-', '.']) {
        return Err(invalid(format!("site name {name} starts with '-' or '.'")));
    }
    if !name
        .chars()
        .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || matches!(ch, '.' | '-'))
    {
        return Err(invalid(format!("site name {name} contains invalid characters")));
    }
    Ok(())
}

pub(crate) fn validate_bench(bench: &Host) -> Result<(), PipelineError> {
    validate_unix_path("bench dir", &bench.bench_dir)?;
    validate_unix_path("bench bin", &bench.bench_bin)?;
    validate_identifier("ssh user", &bench.user)
}

pub(crate) fn validate_unix_path(label: &str, path: &str) -> Result<(), PipelineError> {
    if !path.starts_with('/') {
        return Err(invalid(format!("{label} must be absolute")));
    }
    if path.split('/').any(|segment| segment == "..") {
        return Err(invalid(format!("{label} cannot contain '..'")));
    }
    if path.chars().any(|ch| {
        ch.is_whitespace()
            || matches!(ch, ';' | '&' | '|' | '`' | '$' | '>' | '<' | '"' | '\'' | '\\')
    }) {
        return Err(invalid(format!("{label} contains invalid characters")));
    }
    Ok(())
}

fn validate_identifier(label: &str, value: &str) -> Result<(), PipelineError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(invalid(format!("{label} is empty")));
    }
    if trimmed != value {
        return Err(invalid(format!("{label} contains whitespace")));
    }
    if !value
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_'))
    {
        return Err(invalid(format!("{label} contains invalid characters")));
    }
    Ok(())
}

fn validate_db_host(host: &str) -> Result<(), PipelineError> {
    let trimmed = host.trim();
    if trimmed.is_empty() {
        return Err(invalid("db host is empty".to_string()));
    }
    if trimmed
        .chars()
        .any(|ch| !(ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '_')))
    {
        return Err(invalid("db host contains invalid characters".to_string()));
    }
    Ok(())
}

pub(crate) fn validate_secret(label: &str, value: &str) -> Result<(), PipelineError> {
    if value.is_empty() {
        return Err(invalid(format!("{label} is empty")));
    }
    if value.chars().any(|ch| {
        ch.is_whitespace() || matches!(ch, ';' | '&' | '|' | '`' | '$' | '"' | '\'' | '\\')
    }) {
        return Err(invalid(format!("{label} contains invalid characters")));
    }
    Ok(())
}

pub(crate) fn validate_url(label: &str, value: &str) -> Result<(), PipelineError> {
    if !value.starts_with("http://") && !value.starts_with("https://") && !value.starts_with("file://") {
        return Err(invalid(format!("{label} is not a supported url")));
    }
    if value.chars().any(|ch| {
        ch.is_whitespace() || matches!(ch, ';' | '&' | '|' | '`' | '$' | '"' | '\'' | '\\' | '<' | '>')
    }) {
        return Err(invalid(format!("{label} contains invalid characters")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_domain::Environment;

    fn bench() -> Host {
        Host {
            id: "bench-1".to_string(),
            address: "10.0.0.10".to_string(),
            environment: Environment::Prod,
            labels: Vec::new(),
            user: "deploy".to_string(),
            port: 22,
            identity_file: None,
            bench_dir: "/srv/bench".to_string(),
            bench_bin: "/usr/local/bin/bench".to_string(),
        }
    }

    fn site() -> Site {
        Site::new("one.example.com", "bench-1", "proxy-1", 100)
    }

    fn params() -> ProvisionParams {
        ProvisionParams {
            db_host: "db.internal".to_string(),
            db_name: "one_prod".to_string(),
            db_user: "admin".to_string(),
            db_password: "secret".to_string(),
            admin_password: "hunter2".to_string(),
            apps: vec!["core".to_string(), "payroll".to_string()],
        }
    }

    #[test]
    fn provision_catalog_keeps_fixed_step_order() {
        let definition = provision_definition(&site(), &bench(), &params()).expect("definition");
        let names: Vec<&str> = definition.steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                steps::UPDATE_APPS,
                steps::CONFIGURE_DATABASE,
                steps::DISABLE_DEV_WATCHER,
                steps::ENABLE_SERVICE_AUTOSTART,
                steps::SETUP_PRODUCTION,
                steps::CREATE_SITE,
                steps::SET_DEVELOPER_MODE,
                steps::RESTART_SERVICES,
                steps::REMOVE_FAIL2BAN,
                steps::RUN_INITIAL_SETUP,
            ]
        );
    }

    #[test]
    fn provision_skips_are_environment_dependent() {
        let definition = provision_definition(&site(), &bench(), &params()).expect("definition");
        let by_name = |name: &str| {
            definition
                .steps
                .iter()
                .find(|spec| spec.name == name)
                .expect("step present")
        };
        assert_eq!(
            by_name(steps::SETUP_PRODUCTION).skip_when,
            SkipWhen::OutsideProduction
        );
        assert_eq!(
            by_name(steps::SET_DEVELOPER_MODE).skip_when,
            SkipWhen::InProduction
        );
        assert!(by_name(steps::SET_DEVELOPER_MODE).skip_when.matches(Environment::Prod));
        assert!(!by_name(steps::SET_DEVELOPER_MODE).skip_when.matches(Environment::Dev));
    }

    #[test]
    fn create_site_installs_each_app() {
        let definition = provision_definition(&site(), &bench(), &params()).expect("definition");
        let create = definition
            .steps
            .iter()
            .find(|spec| spec.name == steps::CREATE_SITE)
            .expect("create step");
        assert!(create.commands.iter().any(|cmd| cmd.contains("install-app core")));
        assert!(create.commands.iter().any(|cmd| cmd.contains("install-app payroll")));
        assert_eq!(create.signal, FailureSignal::Stderr);
    }

    #[test]
    fn rejects_shell_metacharacters_in_site_name() {
        let mut bad = site();
        bad.name = "one.example.com; rm -rf /".to_string();
        assert!(matches!(
            provision_definition(&bad, &bench(), &params()),
            Err(PipelineError::InvalidDefinition { .. })
        ));
        assert!(validate_site_name("$(evil)").is_err());
        assert!(validate_site_name("ok-site.example.com").is_ok());
    }

    #[test]
    fn upstream_config_targets_bench_backend() {
        let config = render_upstream_config("one.example.com", "10.0.0.10");
        assert!(config.contains("server_name one.example.com;"));
        assert!(config.contains("proxy_pass http://10.0.0.10:8080;"));

        let definition = register_upstream_definition(&site(), &bench()).expect("definition");
        let add = &definition.steps[0];
        assert_eq!(add.name, steps::ADD_SITE_TO_UPSTREAM);
        assert!(add.commands[1].starts_with("cat <<'BERTH_UPSTREAM_EOF' > /etc/nginx/berth/upstreams/one.example.com.conf"));
        assert_eq!(add.commands[2], "nginx -t");
    }

    #[test]
    fn rename_definitions_carry_new_name() {
        let definition = rename_definition(&site(), &bench(), "two.example.com").expect("definition");
        assert_eq!(
            definition.data.get("new_name").and_then(|v| v.as_str()),
            Some("two.example.com")
        );
        let upstream =
            rename_upstream_definition(&site(), &bench(), "two.example.com").expect("definition");
        assert_eq!(upstream.steps[0].name, steps::RENAME_SITE_ON_UPSTREAM);
        assert!(upstream.steps[0]
            .commands
            .iter()
            .any(|cmd| cmd.contains("rm -f -- /etc/nginx/berth/upstreams/one.example.com.conf")));
    }

    #[test]
    fn url_validation_blocks_injection() {
        assert!(validate_url("backup url", "https://store.example.com/a.sql.gz").is_ok());
        assert!(validate_url("backup url", "https://x/a; rm -rf /").is_err());
        assert!(validate_url("backup url", "ftp://x/a").is_err());
    }
}
