use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lrp_adapters::{CrmContext, CrmFieldMap};
use lrp_core::RoutingConfig;
use lrp_routing::{
    IntakeOutcome, IntakeRequest, LeadIntakeService, LeadRouter, RouteDecision, RoutingMode,
    RoutingRequest, RoutingService,
};
use lrp_storage::LeadRouterStore;
use lrp_sync::LeadRouterConfig;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "lrp")]
#[command(about = "Lead Router Pro: vendor routing and CRM reconciliation")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply database migrations.
    Migrate,
    /// Reconcile local vendors and leads with the CRM once.
    Sync {
        /// Use a JSON contact fixture instead of the live CRM.
        #[arg(long)]
        fixture: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Run reconciliation on `LRP_SYNC_CRON` until interrupted.
    Schedule {
        #[arg(long)]
        fixture: Option<PathBuf>,
    },
    /// Show the eligible pool and the vendor that would be chosen, without claiming it.
    Route {
        #[arg(long)]
        category: String,
        #[arg(long)]
        service: Option<String>,
        #[arg(long)]
        zip: String,
        /// Admit every vendor that is not deactivated or deleted.
        #[arg(long)]
        test_mode: bool,
    },
    /// Create the CRM contact and opportunity for a lead, store it and route it.
    Intake {
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        phone: Option<String>,
        #[arg(long)]
        category: String,
        #[arg(long)]
        service: Option<String>,
        #[arg(long)]
        zip: String,
        #[arg(long, default_value = "cli")]
        source: String,
        #[arg(long)]
        fixture: Option<PathBuf>,
    },
    /// Route an existing lead to a different vendor.
    Reassign {
        lead_id: Uuid,
        #[arg(long)]
        fixture: Option<PathBuf>,
    },
    ResolveZip {
        zip: String,
    },
    RoutingConfig {
        #[command(subcommand)]
        action: RoutingConfigAction,
    },
    Stats,
}

#[derive(Debug, Subcommand)]
enum RoutingConfigAction {
    Get,
    Set {
        /// Share of leads routed by close rate, 0-100.
        #[arg(long)]
        performance: f64,
    },
}

fn init_tracing(config: &LeadRouterConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.log_level)
            .with_context(|| format!("invalid log filter '{}'", config.log_level))?,
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init()
        .map_err(|err| anyhow::anyhow!("installing tracing subscriber: {err}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let config = LeadRouterConfig::from_env();
    init_tracing(&config)?;
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync {
        fixture: None,
        json: false,
    }) {
        Commands::Migrate => {
            lrp_sync::open_store(&config).await?;
            println!("migrations applied to {}", config.database_url);
        }
        Commands::Sync { fixture, json } => {
            let engine = lrp_sync::build_engine(&config, fixture.as_deref()).await?;
            let report = engine.run().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", report.to_markdown());
            }
        }
        Commands::Schedule { fixture } => {
            let engine = Arc::new(lrp_sync::build_engine(&config, fixture.as_deref()).await?);
            let Some(mut sched) = lrp_sync::maybe_build_scheduler(&config, engine).await? else {
                anyhow::bail!("scheduler disabled; set LRP_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            tokio::signal::ctrl_c()
                .await
                .context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Route {
            category,
            service,
            zip,
            test_mode,
        } => {
            let store = lrp_sync::open_store(&config).await?;
            let mode = if test_mode {
                RoutingMode::Test
            } else {
                RoutingMode::Live
            };
            let router = lead_router(&config)?.with_mode(mode);
            let request = RoutingRequest {
                category,
                specific_service: service,
                zip_code: zip,
            };
            let vendors = store.list_vendors().await?;
            let routing = store.routing_config().await?;
            for eligible in router.eligible_vendors(&request, &vendors, None) {
                println!(
                    "eligible: {} ({}) {} [{:?}]",
                    eligible.vendor.display_name(),
                    eligible.vendor.id,
                    eligible.coverage_reason,
                    eligible.service_match
                );
            }
            match router.route(&request, &vendors, &routing, None) {
                Ok(decision) => print_decision("would assign", &decision),
                Err(err) => println!("{err}"),
            }
        }
        Commands::Intake {
            name,
            email,
            phone,
            category,
            service,
            zip,
            source,
            fixture,
        } => {
            let intake = intake_service(&config, fixture.as_deref()).await?;
            let request = IntakeRequest {
                customer_name: name,
                customer_email: email,
                customer_phone: phone,
                category,
                specific_service: service,
                zip_code: zip,
                source,
            };
            let outcome = intake.intake(&CrmContext::new(), &request).await?;
            print_outcome(&outcome);
        }
        Commands::Reassign { lead_id, fixture } => {
            let intake = intake_service(&config, fixture.as_deref()).await?;
            let outcome = intake.reassign(&CrmContext::new(), lead_id).await?;
            print_outcome(&outcome);
        }
        Commands::ResolveZip { zip } => {
            let location = config.zip_database()?.resolve(&zip)?;
            println!("{}", serde_json::to_string_pretty(&location)?);
        }
        Commands::RoutingConfig { action } => {
            let store = lrp_sync::open_store(&config).await?;
            if let RoutingConfigAction::Set { performance } = action {
                store
                    .set_routing_config(RoutingConfig::new(performance)?)
                    .await?;
            }
            let current = store.routing_config().await?;
            println!(
                "performance: {}% round_robin: {}%",
                current.performance_percentage(),
                current.round_robin_percentage()
            );
        }
        Commands::Stats => {
            let store = lrp_sync::open_store(&config).await?;
            let stats = RoutingService::new(store, lead_router(&config)?)
                .stats()
                .await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }

    Ok(())
}

fn lead_router(config: &LeadRouterConfig) -> Result<LeadRouter> {
    Ok(LeadRouter::new(
        Arc::new(config.zip_database()?),
        Arc::new(config.service_matcher()?),
    ))
}

async fn intake_service(
    config: &LeadRouterConfig,
    fixture: Option<&Path>,
) -> Result<LeadIntakeService> {
    let store = lrp_sync::open_store(config).await?;
    let crm = config.crm_client(fixture)?;
    Ok(LeadIntakeService::new(
        crm,
        RoutingService::new(store, lead_router(config)?),
        CrmFieldMap::default(),
    ))
}

fn print_decision(label: &str, decision: &RouteDecision) {
    println!(
        "{label}: {} ({}) via {} from a pool of {} [{}]",
        decision.vendor.display_name(),
        decision.vendor.id,
        decision.method,
        decision.pool_size,
        decision.coverage_reason
    );
}

fn print_outcome(outcome: &IntakeOutcome) {
    match outcome {
        IntakeOutcome::Assigned { lead, decision } => {
            println!("lead {} assigned", lead.id);
            print_decision("vendor", decision);
        }
        IntakeOutcome::Unassigned { lead } => {
            println!("lead {} unassigned ({})", lead.id, lead.status);
        }
    }
}
