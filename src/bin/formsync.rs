use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use formsync::app::App;
use formsync::config::{ConfigLoader, ResolvedConfig};
use formsync::domain::{FormId, FormListing};
use formsync::error::SyncError;
use formsync::http::OpenRosaHttpClient;
use formsync::output::{JsonOutput, StderrProgress};
use formsync::reconcile::{JsonFileRegistry, ReconcileStats};
use formsync::store::FormsStore;
use formsync::task::CancelFlag;
use formsync::upload::DirInstanceStore;

#[derive(Parser)]
#[command(name = "formsync")]
#[command(about = "Synchronize OpenRosa forms and submissions with a remote server")]
#[command(version, author)]
struct Cli {
    /// Path to the config file (defaults to ./formsync.json)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Manage form definitions")]
    Forms(FormsArgs),
    #[command(about = "Manage completed records")]
    Instances(InstancesArgs),
}

#[derive(Args)]
struct FormsArgs {
    #[command(subcommand)]
    command: FormsCommand,
}

#[derive(Subcommand)]
enum FormsCommand {
    #[command(about = "Fetch the remote form catalog")]
    ListRemote,
    #[command(about = "Download forms and reconcile the local registry")]
    Sync(SyncArgs),
    #[command(about = "Reconcile the local registry against the forms tree")]
    Reconcile,
}

#[derive(Args)]
struct SyncArgs {
    /// Form ids to sync; defaults to the config selection, or every
    /// advertised form when neither is given
    form_ids: Vec<String>,
}

#[derive(Args)]
struct InstancesArgs {
    #[command(subcommand)]
    command: InstancesCommand,
}

#[derive(Subcommand)]
enum InstancesCommand {
    #[command(about = "Upload completed records for a form")]
    Upload(UploadArgs),
}

#[derive(Args)]
struct UploadArgs {
    form_id: String,

    /// Record ids to upload; defaults to every pending record
    records: Vec<String>,
}

#[derive(Serialize)]
struct SyncReport {
    forms: std::collections::BTreeMap<FormId, String>,
    reconcile: ReconcileStats,
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(report) => {
            eprintln!("{report:?}");
            let code = report
                .downcast_ref::<SyncError>()
                .map(map_exit_code)
                .unwrap_or(1);
            ExitCode::from(code)
        }
    }
}

fn map_exit_code(error: &SyncError) -> u8 {
    match error {
        SyncError::MissingConfig | SyncError::ConfigRead(_) | SyncError::ConfigParse(_) => 2,
        SyncError::ListingHttp(_)
        | SyncError::ListingStatus { .. }
        | SyncError::ManifestHttp(_)
        | SyncError::ManifestStatus { .. }
        | SyncError::DownloadHttp(_)
        | SyncError::DownloadStatus { .. }
        | SyncError::SubmissionHttp(_)
        | SyncError::SubmissionStatus { .. } => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ConfigLoader::resolve(cli.config.as_deref()).into_diagnostic()?;

    let transport = OpenRosaHttpClient::new(config.auth_token.as_deref()).into_diagnostic()?;
    let store = FormsStore::new(&config.app_root);
    let registry =
        JsonFileRegistry::open(config.app_root.join("registry.json")).into_diagnostic()?;
    let instances = DirInstanceStore::new(store.clone());
    let app = App::new(transport, store, registry, instances);

    match cli.command {
        Commands::Forms(args) => run_forms(args, &app, &config),
        Commands::Instances(args) => run_instances(args, &app, &config),
    }
}

fn run_forms(
    args: FormsArgs,
    app: &App<OpenRosaHttpClient, JsonFileRegistry, DirInstanceStore>,
    config: &ResolvedConfig,
) -> miette::Result<()> {
    let cancel = CancelFlag::new();
    match args.command {
        FormsCommand::ListRemote => {
            let listing = app.fetch_catalog(&config.listing_url(), &StderrProgress);
            JsonOutput::print(&listing).into_diagnostic()?;
            Ok(())
        }
        FormsCommand::Sync(sync_args) => {
            let listing = app.fetch_catalog(&config.listing_url(), &StderrProgress);
            let catalog = match listing {
                FormListing::Forms(forms) => forms,
                other => {
                    JsonOutput::print(&other).into_diagnostic()?;
                    return Err(miette::miette!("form listing unavailable"));
                }
            };

            let selection = selected_form_ids(&sync_args.form_ids, config).into_diagnostic()?;
            let forms: Vec<_> = catalog
                .into_values()
                .filter(|form| {
                    selection.is_empty() || selection.contains(&form.form_id)
                })
                .collect();

            let staged = app
                .sync_forms(&forms, &StderrProgress, &cancel)
                .into_diagnostic()?;
            let stats = if staged.completed {
                app.reconcile(&StderrProgress, &cancel).into_diagnostic()?
            } else {
                ReconcileStats::default()
            };
            JsonOutput::print(&SyncReport {
                forms: staged.statuses,
                reconcile: stats,
            })
            .into_diagnostic()?;
            Ok(())
        }
        FormsCommand::Reconcile => {
            let stats = app.reconcile(&StderrProgress, &cancel).into_diagnostic()?;
            JsonOutput::print(&stats).into_diagnostic()?;
            Ok(())
        }
    }
}

fn run_instances(
    args: InstancesArgs,
    app: &App<OpenRosaHttpClient, JsonFileRegistry, DirInstanceStore>,
    config: &ResolvedConfig,
) -> miette::Result<()> {
    let cancel = CancelFlag::new();
    match args.command {
        InstancesCommand::Upload(upload_args) => {
            let form_id: FormId = upload_args.form_id.parse().into_diagnostic()?;
            let records = if upload_args.records.is_empty() {
                app.pending_records(&form_id).into_diagnostic()?
            } else {
                upload_args.records
            };
            let destination = config.submission_url_for(&form_id);
            let outcome = app
                .upload_instances(&form_id, &destination, &records, &StderrProgress, &cancel)
                .into_diagnostic()?;
            JsonOutput::print(&outcome).into_diagnostic()?;
            Ok(())
        }
    }
}

fn selected_form_ids(
    args: &[String],
    config: &ResolvedConfig,
) -> Result<Vec<FormId>, SyncError> {
    if !args.is_empty() {
        return args.iter().map(|value| value.parse()).collect();
    }
    Ok(config
        .forms
        .iter()
        .map(|entry| entry.form_id.clone())
        .collect())
}
