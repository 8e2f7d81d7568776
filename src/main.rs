use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{ArgGroup, Args, Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tracing::warn;
use uuid::Uuid;

use early_warning::db::{self, PgStore};
use early_warning::models::{Channel, Language, MessageContent, MessageStatus};
use early_warning::reconcile::FlagAction;
use early_warning::rules::{RulePatch, WindowMode};
use early_warning::{
    AppConfig, BulkRequest, CancelHandle, DeliveryTracker, Dispatcher, DryRunProvider,
    EarlyWarning, FlagReconciler, RiskDetector, RuleConfigService, StudentReport, TemplateEngine,
};

#[derive(Parser)]
#[command(name = "early-warning")]
#[command(about = "Student risk detection and guardian notifications", long_about = None)]
struct Cli {
    /// Log at debug level unless RUST_LOG is set
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load a demo school with three students
    Seed,
    /// Import attendance from a CSV file (student_ref,date,status)
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Show or change a school's risk rules
    Rules {
        #[command(subcommand)]
        command: RulesCommand,
    },
    /// Detect risks and reconcile flags
    #[command(group(
        ArgGroup::new("scope")
            .args(["student", "school"])
            .required(true)
            .multiple(false)
    ))]
    Detect {
        /// Student UUID or external reference
        #[arg(long)]
        student: Option<String>,
        /// School UUID or name
        #[arg(long)]
        school: Option<String>,
        /// Alert guardians about new or escalated flags
        #[arg(long)]
        notify: bool,
        #[arg(long)]
        json: bool,
    },
    /// Send a message to the primary guardians of several students
    #[command(group(
        ArgGroup::new("content")
            .args(["template", "message"])
            .required(true)
            .multiple(false)
    ))]
    Notify {
        /// Comma-separated student UUIDs or external references
        #[arg(long, value_delimiter = ',', required = true)]
        students: Vec<String>,
        #[arg(long)]
        template: Option<String>,
        #[arg(long)]
        message: Option<String>,
        #[arg(long)]
        subject: Option<String>,
        /// Extra template variables as key=value
        #[arg(long = "var")]
        vars: Vec<String>,
        #[arg(long, default_value = "SMS")]
        channel: Channel,
        #[arg(long, default_value = "en")]
        language: Language,
    },
    /// Show a message and its status history
    Status {
        #[arg(long)]
        message: Uuid,
    },
    /// Apply a provider delivery report
    Receipt {
        #[arg(long)]
        provider_id: String,
        #[arg(long)]
        status: MessageStatus,
        #[arg(long)]
        detail: Option<String>,
    },
}

#[derive(Subcommand)]
enum RulesCommand {
    Show {
        #[arg(long)]
        school: String,
    },
    Set {
        #[arg(long)]
        school: String,
        #[command(flatten)]
        patch: RuleArgs,
    },
}

#[derive(Args)]
struct RuleArgs {
    #[arg(long, allow_negative_numbers = true)]
    medium_absences: Option<i64>,
    #[arg(long, allow_negative_numbers = true)]
    high_absences: Option<i64>,
    #[arg(long, allow_negative_numbers = true)]
    critical_absences: Option<i64>,
    #[arg(long, allow_negative_numbers = true)]
    window_days: Option<i64>,
    #[arg(long)]
    window_mode: Option<WindowMode>,
    #[arg(long, allow_negative_numbers = true)]
    medium_pct: Option<f64>,
    #[arg(long, allow_negative_numbers = true)]
    high_pct: Option<f64>,
    #[arg(long, allow_negative_numbers = true)]
    critical_pct: Option<f64>,
    #[arg(long, allow_negative_numbers = true)]
    medium_factor_count: Option<i64>,
    #[arg(long, allow_negative_numbers = true)]
    high_factor_count: Option<i64>,
    #[arg(long, allow_negative_numbers = true)]
    sibling_cap: Option<i64>,
    #[arg(long, allow_negative_numbers = true)]
    threshold_km: Option<f64>,
    #[arg(long, allow_negative_numbers = true)]
    high_km: Option<f64>,
}

impl From<RuleArgs> for RulePatch {
    fn from(args: RuleArgs) -> Self {
        RulePatch {
            attendance_medium_absences: args.medium_absences,
            attendance_high_absences: args.high_absences,
            attendance_critical_absences: args.critical_absences,
            attendance_window_days: args.window_days,
            attendance_window_mode: args.window_mode,
            performance_medium_pct: args.medium_pct,
            performance_high_pct: args.high_pct,
            performance_critical_pct: args.critical_pct,
            socioeconomic_medium_factor_count: args.medium_factor_count,
            socioeconomic_high_factor_count: args.high_factor_count,
            socioeconomic_sibling_cap: args.sibling_cap,
            distance_threshold_km: args.threshold_km,
            distance_high_km: args.high_km,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    early_warning::init_tracing(if cli.verbose {
        "debug,sqlx=warn"
    } else {
        "info,sqlx=warn"
    });

    let config = AppConfig::from_env()?;

    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set to a production Postgres instance")?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;

    let store = Arc::new(PgStore::new(pool.clone()));
    let default_language = config.dispatch.default_language;
    let templates = Arc::new(match &config.template_catalog {
        Some(path) => TemplateEngine::from_json_file(path, default_language)?,
        None => TemplateEngine::builtin(default_language),
    });
    let rules = RuleConfigService::new(store.clone());
    let tracker = DeliveryTracker::new(store.clone());
    let dispatcher = Dispatcher::new(
        Arc::new(DryRunProvider),
        templates,
        tracker.clone(),
        store.clone(),
        &config.dispatch,
    );

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            let school_id = db::seed(&pool).await?;
            println!("Seed data inserted for school {school_id}.");
        }
        Commands::Import { csv } => {
            let summary = db::import_csv(&pool, &csv).await?;
            println!(
                "Imported {} attendance records from {} ({} rows for unknown students).",
                summary.upserted,
                csv.display(),
                summary.unknown_students
            );
        }
        Commands::Rules { command } => match command {
            RulesCommand::Show { school } => {
                let school_id = db::resolve_school(&pool, &school).await?;
                let config = rules.get_or_create(school_id).await?;
                println!("{}", serde_json::to_string_pretty(&config)?);
            }
            RulesCommand::Set { school, patch } => {
                let school_id = db::resolve_school(&pool, &school).await?;
                let config = rules.update(school_id, &RulePatch::from(patch)).await?;
                println!("Rules updated at {}.", config.updated_at);
                println!("{}", serde_json::to_string_pretty(&config)?);
            }
        },
        Commands::Detect {
            student,
            school,
            notify,
            json,
        } => {
            let detector = RiskDetector::new(store.clone(), rules.clone());
            let mut engine = EarlyWarning::new(
                detector,
                FlagReconciler::new(store.clone()),
                config.detection_concurrency,
            );
            if notify {
                engine = engine.with_alerts(dispatcher.clone());
            }

            if let Some(reference) = student {
                let student_id = db::resolve_student(&pool, &reference).await?;
                let report = engine.run_for_student(student_id).await?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&report)?);
                } else {
                    print_report(&report);
                }
            } else if let Some(reference) = school {
                let school_id = db::resolve_school(&pool, &reference).await?;
                let entries = engine.sweep_school(school_id).await?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&entries)?);
                    return Ok(());
                }
                if entries.is_empty() {
                    println!("No active students in this school.");
                    return Ok(());
                }
                for entry in &entries {
                    match (&entry.report, &entry.error) {
                        (Some(report), _) => print_report(report),
                        (None, Some(error)) => println!("{}: detection failed: {error}", entry.student_id),
                        (None, None) => {}
                    }
                }
            }
        }
        Commands::Notify {
            students,
            template,
            message,
            subject,
            vars,
            channel,
            language,
        } => {
            let mut student_ids = Vec::with_capacity(students.len());
            for reference in &students {
                student_ids.push(db::resolve_student(&pool, reference).await?);
            }

            let content = match (template, message) {
                (Some(template_id), _) => MessageContent::Template {
                    template_id,
                    variables: parse_vars(&vars)?,
                },
                (None, Some(body)) => MessageContent::Raw { subject, body },
                (None, None) => anyhow::bail!("either --template or --message is required"),
            };

            let cancel = CancelHandle::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupt received, cancelling remaining recipients");
                    on_interrupt.cancel();
                }
            });

            let results = dispatcher
                .send_bulk(
                    &BulkRequest {
                        student_ids,
                        channel,
                        content,
                        language,
                    },
                    &cancel,
                )
                .await?;

            for result in &results {
                let status = result
                    .status
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "SKIPPED".to_string());
                match &result.reason {
                    Some(reason) => println!("- {} {status}: {reason}", result.student_id),
                    None => println!("- {} {status}", result.student_id),
                }
            }
            let skipped = results.iter().filter(|r| r.skipped).count();
            println!(
                "{} recipients, {} attempted, {} skipped.",
                results.len(),
                results.len() - skipped,
                skipped
            );
        }
        Commands::Status { message } => {
            let Some(found) = tracker.message(message).await? else {
                println!("No message {message}.");
                return Ok(());
            };
            println!(
                "Message {} to {} is {} after {} attempts.",
                found.id,
                found.recipient.name,
                found.status(),
                found.attempt_count()
            );
            for delivery in &found.deliveries {
                println!(
                    "- {} {} {} ({} attempts){}",
                    delivery.channel,
                    delivery.address,
                    delivery.status,
                    delivery.attempt_count,
                    delivery
                        .last_error
                        .as_deref()
                        .map(|e| format!(": {e}"))
                        .unwrap_or_default()
                );
            }
            for event in tracker.history(message).await? {
                println!("  {} {} {} -> {}", event.at, event.channel, event.from, event.to);
            }
        }
        Commands::Receipt {
            provider_id,
            status,
            detail,
        } => {
            let delivery = tracker
                .apply_provider_callback(&provider_id, status, detail)
                .await?;
            println!(
                "Message {} ({}) is now {}.",
                delivery.message_id, delivery.channel, delivery.status
            );
        }
    }

    Ok(())
}

fn parse_vars(pairs: &[String]) -> anyhow::Result<HashMap<String, String>> {
    pairs
        .iter()
        .map(|pair| -> anyhow::Result<(String, String)> {
            let (key, value) = pair
                .split_once('=')
                .with_context(|| format!("template variable must be key=value, got {pair}"))?;
            Ok((key.trim().to_string(), value.to_string()))
        })
        .collect()
}

fn print_report(report: &StudentReport) {
    if report.outcomes.is_empty() {
        println!("{}: no risks.", report.student_id);
        return;
    }
    println!("{}:", report.student_id);
    for outcome in &report.outcomes {
        let (label, flag) = match &outcome.action {
            FlagAction::Created(flag) => ("opened", Some(flag)),
            FlagAction::Updated { flag, .. } => ("updated", Some(flag)),
            FlagAction::Resolved(flag) => ("resolved", Some(flag)),
            FlagAction::Unchanged(flag) => ("unchanged", Some(flag)),
            FlagAction::AcceptedConcurrent(flag) => ("concurrent", flag.as_ref()),
        };
        match flag {
            Some(flag) => println!(
                "- {} {label} {} ({})",
                outcome.domain,
                flag.severity,
                flag.reasons.join("; ")
            ),
            None => println!("- {} {label}", outcome.domain),
        }
    }
    for alert in &report.alerts {
        match (&alert.status, &alert.error) {
            (Some(status), _) => println!("  alert {} {status}", alert.flag_domain),
            (None, Some(error)) => println!("  alert {} failed: {error}", alert.flag_domain),
            (None, None) => {}
        }
    }
}
