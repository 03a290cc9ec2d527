use std::path::PathBuf;

use berth_cli_core::{audit, config, CliError};
use berth_domain::{unix_now, Environment, Host, JobKind, Site, SiteStatus};
use berth_pipeline::{
    backup::{run_backup, BackupOptions},
    catalog,
    restore::run_restore,
    PipelineExecutor, ProcessSessionFactory,
};
use berth_reconcile::JobReconciler;
use berth_retention::enforce;
use berth_storage::{create_storage_backend, DirObjectStore, StorageBackend};
use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "berth")]
#[command(about = "Tenant site lifecycle manager", long_about = None)]
struct BerthCli {
    #[command(subcommand)]
    command: BerthCommand,
}

#[derive(Subcommand)]
enum BerthCommand {
    #[command(subcommand)]
    Host(HostCommand),
    #[command(subcommand)]
    Site(SiteCommand),
    #[command(subcommand)]
    Job(JobCommand),
    #[command(subcommand)]
    Retention(RetentionCommand),
}

#[derive(Subcommand)]
enum HostCommand {
    List,
    Add(HostAddCommand),
    Remove(HostRemoveCommand),
    Show(HostShowCommand),
}

#[derive(Args)]
struct HostAddCommand {
    #[arg(long)]
    id: String,
    #[arg(long)]
    address: String,
    #[arg(long, default_value = "root")]
    user: String,
    #[arg(long, default_value_t = 22)]
    port: u16,
    #[arg(long, default_value = "dev")]
    env: String,
    #[arg(long)]
    label: Vec<String>,
    #[arg(long)]
    identity_file: Option<String>,
    #[arg(long, default_value = "/srv/bench")]
    bench_dir: String,
    #[arg(long, default_value = "/usr/local/bin/bench")]
    bench_bin: String,
}

#[derive(Args)]
struct HostRemoveCommand {
    #[arg(long)]
    id: String,
}

#[derive(Args)]
struct HostShowCommand {
    #[arg(long)]
    id: String,
}

#[derive(Subcommand)]
enum SiteCommand {
    List,
    Show(SiteShowCommand),
    Create(SiteCreateCommand),
    Update(SiteNameCommand),
    Backup(SiteBackupCommand),
    Restore(SiteRestoreCommand),
    Rename(SiteRenameCommand),
    Archive(SiteNameCommand),
    Move(SiteMoveCommand),
}

#[derive(Args)]
struct SiteShowCommand {
    #[arg(long)]
    name: String,
}

#[derive(Args)]
struct SiteNameCommand {
    #[arg(long)]
    name: String,
}

#[derive(Args)]
struct SiteCreateCommand {
    #[arg(long)]
    name: String,
    #[arg(long)]
    bench: String,
    #[arg(long)]
    upstream: String,
    #[arg(long)]
    db_host: String,
    #[arg(long)]
    db_name: String,
    #[arg(long, default_value = "admin")]
    db_user: String,
    #[arg(long)]
    db_password: String,
    #[arg(long)]
    admin_password: String,
    #[arg(long)]
    app: Vec<String>,
}

#[derive(Args)]
struct SiteBackupCommand {
    #[arg(long)]
    name: String,
    #[arg(long)]
    with_files: bool,
    #[arg(long, default_value_t = 7)]
    max_per_class: usize,
}

#[derive(Args)]
struct SiteRestoreCommand {
    #[arg(long)]
    name: String,
    #[arg(long)]
    backup: String,
    #[arg(long)]
    admin_password: String,
}

#[derive(Args)]
struct SiteRenameCommand {
    #[arg(long)]
    name: String,
    #[arg(long)]
    new_name: String,
}

#[derive(Args)]
struct SiteMoveCommand {
    #[arg(long)]
    name: String,
    #[arg(long)]
    target: String,
}

#[derive(Subcommand)]
enum JobCommand {
    List(JobListCommand),
    Show(JobShowCommand),
    Timeout(JobShowCommand),
}

#[derive(Args)]
struct JobListCommand {
    #[arg(long)]
    site: String,
}

#[derive(Args)]
struct JobShowCommand {
    #[arg(long)]
    id: String,
}

#[derive(Subcommand)]
enum RetentionCommand {
    Run(RetentionRunCommand),
}

#[derive(Args)]
struct RetentionRunCommand {
    #[arg(long)]
    site: String,
    #[arg(long, default_value_t = 7)]
    max_per_class: usize,
}

fn main() {
    match run() {
        Ok(()) => {}
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<(), CliError> {
    let cli = BerthCli::parse();
    let backend = create_storage_backend();
    match cli.command {
        BerthCommand::Host(cmd) => handle_host(backend.as_ref(), cmd),
        BerthCommand::Site(cmd) => handle_site(backend.as_ref(), cmd),
        BerthCommand::Job(cmd) => handle_job(backend.as_ref(), cmd),
        BerthCommand::Retention(cmd) => handle_retention(cmd),
    }
}

fn parse_environment(value: &str) -> Result<Environment, CliError> {
    match value.to_lowercase().as_str() {
        "dev" => Ok(Environment::Dev),
        "test" => Ok(Environment::Test),
        "staging" => Ok(Environment::Staging),
        "prod" | "production" => Ok(Environment::Prod),
        other => Err(CliError::InvalidInput(format!("unknown environment: {other}"))),
    }
}

fn object_store() -> Result<DirObjectStore, CliError> {
    let base = match std::env::var("BERTH_OBJECT_STORE_DIR") {
        Ok(custom) if !custom.trim().is_empty() => PathBuf::from(custom.trim()),
        _ => config::ensure_home_dir()?.join("objects"),
    };
    Ok(DirObjectStore::new(base))
}

fn handle_host(backend: &dyn StorageBackend, cmd: HostCommand) -> Result<(), CliError> {
    let store = backend.store();
    match cmd {
        HostCommand::List => {
            for host in store.list_hosts()? {
                println!(
                    "{}\t{}\t{:?}\t{}@{}:{}",
                    host.id, host.address, host.environment, host.user, host.address, host.port
                );
            }
            Ok(())
        }
        HostCommand::Add(args) => {
            let host = Host {
                id: args.id.clone(),
                address: args.address,
                environment: parse_environment(&args.env)?,
                labels: args.label,
                user: args.user,
                port: args.port,
                identity_file: args.identity_file,
                bench_dir: args.bench_dir,
                bench_bin: args.bench_bin,
            };
            store.put_host(&host)?;
            audit::write_audit_log("host", &format!("added host {}", args.id))?;
            println!("host {} saved", args.id);
            Ok(())
        }
        HostCommand::Remove(args) => {
            store.delete_host(&args.id)?;
            audit::write_audit_log("host", &format!("removed host {}", args.id))?;
            println!("host {} removed", args.id);
            Ok(())
        }
        HostCommand::Show(args) => {
            let host = store.get_host(&args.id)?;
            println!("{}", serde_json::to_string_pretty(&host)?);
            Ok(())
        }
    }
}

fn handle_site(backend: &dyn StorageBackend, cmd: SiteCommand) -> Result<(), CliError> {
    let store = backend.store();
    let sink = backend.sink();
    let factory = ProcessSessionFactory::default();
    let executor = PipelineExecutor::new(store, sink, &factory);

    match cmd {
        SiteCommand::List => {
            for site in store.list_sites()? {
                println!("{}\t{}\t{}", site.name, site.status, site.bench_host);
            }
            Ok(())
        }
        SiteCommand::Show(args) => {
            let site = store.get_site(&args.name)?;
            println!("{}", serde_json::to_string_pretty(&site)?);
            Ok(())
        }
        SiteCommand::Create(args) => {
            let bench = store.get_host(&args.bench)?;
            let upstream = store.get_host(&args.upstream)?;
            let mut site = Site::new(&args.name, &bench.id, &upstream.id, unix_now());
            catalog::validate_site_name(&site.name).map_err(CliError::Pipeline)?;
            store.put_site(&site)?;
            audit::write_audit_log("site", &format!("provisioning site {}", site.name))?;

            executor.admit(&site, JobKind::Provision)?;
            site.status = SiteStatus::Installing;
            store.put_site(&site)?;

            let params = catalog::ProvisionParams {
                db_host: args.db_host,
                db_name: args.db_name,
                db_user: args.db_user,
                db_password: args.db_password,
                admin_password: args.admin_password,
                apps: args.app,
            };
            let provision = catalog::provision_definition(&site, &bench, &params)?;
            let bench_job = executor.execute(&site, &bench, &provision)?;
            println!("bench job {}: {}", bench_job.id, bench_job.status);

            let register = catalog::register_upstream_definition(&site, &bench)?;
            let proxy_job = executor.execute(&site, &upstream, &register)?;
            println!("proxy job {}: {}", proxy_job.id, proxy_job.status);

            let site = store.get_site(&args.name)?;
            println!("site {} is {}", site.name, site.status);
            Ok(())
        }
        SiteCommand::Update(args) => {
            let mut site = store.get_site(&args.name)?;
            let bench = store.get_host(&site.bench_host)?;
            executor.admit(&site, JobKind::Update)?;
            audit::write_audit_log("site", &format!("updating site {}", site.name))?;

            // Remember what the site was doing so a successful run can put
            // it back; the executor itself never sets transient states.
            site.status_before_update = Some(site.status);
            site.status = SiteStatus::Updating;
            store.put_site(&site)?;

            let definition = catalog::update_definition(&site, &bench)?;
            let job = executor.execute(&site, &bench, &definition)?;
            println!("job {}: {}", job.id, job.status);
            let site = store.get_site(&args.name)?;
            println!("site {} is {}", site.name, site.status);
            Ok(())
        }
        SiteCommand::Backup(args) => {
            let site = store.get_site(&args.name)?;
            let bench = store.get_host(&site.bench_host)?;
            let objects = object_store()?;
            audit::write_audit_log("site", &format!("backing up site {}", site.name))?;
            let record = run_backup(
                store,
                sink,
                &factory,
                &objects,
                &site,
                &bench,
                &BackupOptions {
                    with_files: args.with_files,
                    max_per_class: args.max_per_class,
                },
            )?;
            println!("backup {}: {}", record.id, record.status);
            Ok(())
        }
        SiteCommand::Restore(args) => {
            let site = store.get_site(&args.name)?;
            let bench = store.get_host(&site.bench_host)?;
            let backup = store.get_backup(&args.backup)?;
            if backup.site != site.name {
                return Err(CliError::InvalidInput(format!(
                    "backup {} belongs to {}",
                    backup.id, backup.site
                )));
            }
            let objects = object_store()?;
            audit::write_audit_log(
                "site",
                &format!("restoring site {} from {}", site.name, backup.id),
            )?;
            let job = run_restore(
                store,
                sink,
                &factory,
                &objects,
                &site,
                &bench,
                &backup,
                &args.admin_password,
            )?;
            println!("job {}: {}", job.id, job.status);
            let site = store.get_site(&args.name)?;
            println!("site {} is {}", site.name, site.status);
            Ok(())
        }
        SiteCommand::Rename(args) => {
            let site = store.get_site(&args.name)?;
            let bench = store.get_host(&site.bench_host)?;
            let upstream = store.get_host(&site.upstream_host)?;
            executor.admit(&site, JobKind::Rename)?;
            audit::write_audit_log(
                "site",
                &format!("renaming site {} to {}", site.name, args.new_name),
            )?;

            let rename = catalog::rename_definition(&site, &bench, &args.new_name)?;
            let bench_job = executor.execute(&site, &bench, &rename)?;
            println!("bench job {}: {}", bench_job.id, bench_job.status);

            let rename_upstream =
                catalog::rename_upstream_definition(&site, &bench, &args.new_name)?;
            let proxy_job = executor.execute(&site, &upstream, &rename_upstream)?;
            println!("proxy job {}: {}", proxy_job.id, proxy_job.status);
            Ok(())
        }
        SiteCommand::Archive(args) => {
            let site = store.get_site(&args.name)?;
            let bench = store.get_host(&site.bench_host)?;
            let upstream = store.get_host(&site.upstream_host)?;
            executor.admit(&site, JobKind::Archive)?;
            audit::write_audit_log("site", &format!("archiving site {}", site.name))?;

            let archive = catalog::archive_definition(&site, &bench)?;
            let bench_job = executor.execute(&site, &bench, &archive)?;
            println!("bench job {}: {}", bench_job.id, bench_job.status);

            let remove = catalog::remove_upstream_definition(&site)?;
            let proxy_job = executor.execute(&site, &upstream, &remove)?;
            println!("proxy job {}: {}", proxy_job.id, proxy_job.status);

            let site = store.get_site(&args.name)?;
            println!("site {} is {}", site.name, site.status);
            Ok(())
        }
        SiteCommand::Move(args) => {
            let mut site = store.get_site(&args.name)?;
            let bench = store.get_host(&site.bench_host)?;
            let target = store.get_host(&args.target)?;
            executor.admit(&site, JobKind::MoveToBench)?;
            audit::write_audit_log(
                "site",
                &format!("moving site {} to {}", site.name, target.id),
            )?;

            site.status_before_update = Some(site.status);
            site.status = SiteStatus::Updating;
            store.put_site(&site)?;

            let definition = catalog::move_definition(&site, &bench, &target)?;
            let job = executor.execute(&site, &bench, &definition)?;
            println!("job {}: {}", job.id, job.status);
            let site = store.get_site(&args.name)?;
            println!("site {} is {} on {}", site.name, site.status, site.bench_host);
            Ok(())
        }
    }
}

fn handle_job(backend: &dyn StorageBackend, cmd: JobCommand) -> Result<(), CliError> {
    let store = backend.store();
    match cmd {
        JobCommand::List(args) => {
            for job in store.jobs_for_site(&args.site)? {
                println!("{}\t{}\t{}", job.id, job.kind, job.status);
            }
            Ok(())
        }
        JobCommand::Show(args) => {
            let job = store.get_job(&args.id)?;
            println!("{}", serde_json::to_string_pretty(&job)?);
            Ok(())
        }
        JobCommand::Timeout(args) => {
            let reconciler = JobReconciler::new(store, backend.sink());
            let job = reconciler.mark_delivery_failure(&args.id)?;
            audit::write_audit_log("job", &format!("timed out job {}", job.id))?;
            println!("job {} marked {}", job.id, job.status);
            Ok(())
        }
    }
}

fn handle_retention(cmd: RetentionCommand) -> Result<(), CliError> {
    match cmd {
        RetentionCommand::Run(args) => {
            let objects = object_store()?;
            let report = enforce(
                &objects,
                &format!("{}/", args.site),
                &berth_domain::ArtifactClass::ALL,
                args.max_per_class,
            )?;
            println!(
                "examined {} objects, deleted {}",
                report.examined,
                report.deleted.len()
            );
            for key in &report.deleted {
                println!("evicted {key}");
            }
            for (key, reason) in &report.failed {
                eprintln!("failed to evict {key}: {reason}");
            }
            Ok(())
        }
    }
}
