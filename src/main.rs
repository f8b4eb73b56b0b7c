use ayon_sync::ayon::{AyonCache, FeedQuery};
use ayon_sync::config::Config;
use ayon_sync::logging;
use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "ayon-sync")]
#[command(about = "Cached, optimistic command line access to an AYON server")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/ayon-sync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List addon bundles
  Bundles {
    /// Include archived bundles
    #[arg(long)]
    archived: bool,
  },
  /// Mark a bundle as (not) the production bundle
  SetProduction {
    bundle: String,
    #[arg(action = clap::ArgAction::Set)]
    production: bool,
  },
  /// Show the activity feed of one or more entities
  Activities {
    project: String,
    #[arg(required = true)]
    entity_ids: Vec<String>,
    /// Feed filter (activity, comments, versions, checklists)
    #[arg(long, default_value = "activity")]
    filter: String,
  },
  /// Comment on an entity
  Comment {
    project: String,
    entity_type: String,
    entity_id: String,
    text: String,
  },
  /// List projects
  Projects,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _guard = match config.log.path() {
    Some(path) => Some(logging::init(&path)?),
    None => None,
  };

  let client = AyonCache::new(&config)?;
  info!(command = ?args.command, "running");
  run(&client, args.command).await
}

async fn run(client: &AyonCache, command: Command) -> Result<()> {
  match command {
    Command::Bundles { archived } => {
      for bundle in client.bundles(archived).await? {
        let mut flags = Vec::new();
        if bundle.is_production {
          flags.push("production");
        }
        if bundle.is_staging {
          flags.push("staging");
        }
        if bundle.is_dev {
          flags.push("dev");
        }
        if bundle.is_archived {
          flags.push("archived");
        }
        println!("{:<32} {}", bundle.name, flags.join(","));
      }
    }
    Command::SetProduction { bundle, production } => {
      client.set_production(&bundle, production).await?;
      println!("{}: production={}", bundle, production);
    }
    Command::Activities {
      project,
      entity_ids,
      filter,
    } => {
      let query = FeedQuery {
        project_name: project,
        entity_ids,
        filter,
        ..FeedQuery::default()
      };
      let feed = client.activities(&query).await?;
      for activity in &feed.activities {
        println!(
          "{} {:<10} {:<12} {}",
          activity.created_at.format("%Y-%m-%d %H:%M"),
          activity.activity_type,
          activity.author.as_deref().unwrap_or("-"),
          activity.body.lines().next().unwrap_or_default()
        );
      }
      if feed.page_info.has_previous_page {
        println!("(older activities not shown)");
      }
    }
    Command::Comment {
      project,
      entity_type,
      entity_id,
      text,
    } => {
      let feed = FeedQuery {
        project_name: project,
        entity_ids: vec![entity_id.clone()],
        filter: "comments".to_string(),
        ..FeedQuery::default()
      };
      let response = client.comment(&feed, &entity_type, &entity_id, &text).await?;
      match response.get("id").and_then(|id| id.as_str()) {
        Some(id) => println!("created activity {}", id),
        None => println!("comment posted"),
      }
    }
    Command::Projects => {
      for project in client.projects().await? {
        let state = if project.active { "" } else { " (inactive)" };
        println!("{:<24} {}{}", project.name, project.code, state);
      }
    }
  }

  let diagnostics = client.layer().diagnostics();
  info!(fetches = diagnostics.fetches, "done");
  Ok(())
}
