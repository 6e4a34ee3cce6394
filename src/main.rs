// GateCrash Forms - Main Entry Point
// Copyright 2026 Joseph Stone - All Rights Reserved
//
// CLI over the submission pipeline and its storage.
// Usage:
//   gatecrash-forms init                                  # Create forms/ responses/ and an example form
//   gatecrash-forms check <schema.json>                   # Load and check a schema
//   gatecrash-forms submit <form-id> --data body.json     # Run one submission through the pipeline
//   gatecrash-forms token                                 # Issue a CSRF token (security.require_csrf)
//   gatecrash-forms responses list <form-id>              # Print stored responses
//   gatecrash-forms responses export <form-id> --format csv
//   gatecrash-forms forms                                 # List registry form ids
//   gatecrash-forms config set smtp.auth.user me@example.com
//   gatecrash-forms config show

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use gatecrash_forms::{
    config::GlobalConfig,
    notify::SpoolMailer,
    paths,
    pipeline::{Pipeline, SubmissionMeta},
    schema::FormSchema,
    store::StorageFormat,
};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const EXAMPLE_FORM: &str = r#"{
  "title": "Contact Us",
  "description": "We usually reply within a day.",
  "fields": [
    { "name": "name", "type": "text", "label": "Your Name", "required": true, "maxLength": 100 },
    { "name": "email", "type": "email", "label": "Email", "required": true },
    { "name": "topic", "type": "select", "label": "Topic", "options": ["Sales", "Support", "Other"] },
    { "name": "message", "type": "textarea", "label": "Message", "required": true, "maxLength": 2000 }
  ],
  "submit": {
    "storage": "contact.json",
    "email": "owner@example.com"
  }
}
"#;

#[derive(Parser)]
#[command(name = "gatecrash-forms")]
#[command(author = "Joseph Stone")]
#[command(version = "1.0.0")]
#[command(about = "GateCrash Forms - schema-driven form submission pipeline")]
struct Cli {
    /// Config home (default: $GATECRASH_HOME or ~/.gatecrash)
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create forms/ and responses/ with an example contact form
    Init,

    /// Load and check a form schema file
    Check {
        /// Schema JSON file
        schema: PathBuf,
    },

    /// Run one submission through the pipeline
    Submit {
        /// Form id (file stem under forms/)
        form_id: String,

        /// Request body file (JSON or urlencoded), "-" for stdin
        #[arg(short, long, default_value = "-")]
        data: String,

        /// Client IP used for rate limiting
        #[arg(long)]
        ip: Option<String>,

        /// Client user agent recorded with the response
        #[arg(long)]
        user_agent: Option<String>,
    },

    /// Issue a single-use CSRF token for the `_csrf` field
    Token,

    /// Inspect and manage stored responses
    Responses {
        #[command(subcommand)]
        action: ResponsesAction,
    },

    /// List forms available in the registry
    Forms,

    /// Read or change the global config
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ResponsesAction {
    /// Print stored responses as JSON
    List { form_id: String },

    /// Print the number of stored responses
    Count { form_id: String },

    /// Write all responses for a form to exports/ in the chosen format
    Export {
        form_id: String,

        #[arg(short, long, value_enum, default_value_t = ExportFormat::Csv)]
        format: ExportFormat,
    },

    /// Delete every stored artifact and export for a form
    Purge {
        form_id: String,

        /// Required; purge is not reversible
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Set a dotted key, e.g. smtp.auth.user
    Set { key: String, value: String },

    /// Print the effective config (SMTP password masked)
    Show,
}

#[derive(Clone, Copy, ValueEnum)]
enum ExportFormat {
    Json,
    Csv,
}

impl From<ExportFormat> for StorageFormat {
    fn from(format: ExportFormat) -> Self {
        match format {
            ExportFormat::Json => StorageFormat::Json,
            ExportFormat::Csv => StorageFormat::Csv,
        }
    }
}

fn read_body(source: &str) -> Result<String> {
    if source == "-" {
        let mut body = String::new();
        std::io::stdin()
            .read_to_string(&mut body)
            .context("Failed to read submission body from stdin")?;
        Ok(body)
    } else {
        std::fs::read_to_string(source).with_context(|| format!("Failed to read submission body {:?}", source))
    }
}

fn build_pipeline(config: &GlobalConfig, home: &Path) -> Pipeline {
    let outbox = paths::resolve(home, &config.outbox_dir);
    Pipeline::from_config(config, home, Arc::new(SpoolMailer::new(outbox)))
}

/// Store key and artifact format declared by a form's `submit.storage`
fn declared_storage(pipeline: &Pipeline, form_id: &str) -> Result<(String, StorageFormat)> {
    let schema = pipeline
        .registry()
        .load(form_id)
        .with_context(|| format!("Failed to load form '{}'", form_id))?;
    match (schema.storage_key(), schema.storage_format()) {
        (Some(key), Some(format)) => Ok((key, format)),
        _ => Err(anyhow!("Form '{}' declares no storage", form_id)),
    }
}

fn main() -> Result<()> {
    // Initialize logging (safe if already init)
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).try_init();

    let cli = Cli::parse();

    if let Some(home) = &cli.home {
        paths::set_config_home(home.clone());
    }
    let home = paths::config_home();
    let config_path = paths::config_file();

    let config = GlobalConfig::load(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    match &cli.command {
        Commands::Init => {
            let forms_dir = paths::resolve(home, &config.forms_dir);
            let responses_dir = paths::resolve(home, &config.responses_dir);
            for dir in [&forms_dir, &responses_dir] {
                std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
            }

            let example = forms_dir.join("contact.json");
            if example.exists() {
                println!("Exists:  {:?}", example);
            } else {
                std::fs::write(&example, EXAMPLE_FORM)
                    .with_context(|| format!("Failed to write {:?}", example))?;
                println!("Created: {:?}", example);
            }

            if !config_path.exists() {
                config.save(&config_path)?;
                println!("Created: {:?}", config_path);
            }
            println!();
            println!("Next: gatecrash-forms config set smtp.host smtp.example.com");
        }

        Commands::Check { schema } => {
            let form = FormSchema::load(schema).with_context(|| format!("Invalid schema {:?}", schema))?;

            println!("Form:    {}", form.title);
            println!("Fields:  {}", form.fields.len());
            for field in &form.fields {
                println!(
                    "  - {} ({}){}",
                    field.name,
                    field.field_type.as_str(),
                    if field.required { " required" } else { "" }
                );
            }
            match (&form.submit.storage, form.storage_format()) {
                (Some(path), Some(format)) => println!("Storage: {} ({})", path, format.extension()),
                _ => println!("Storage: none"),
            }
            match &form.submit.email {
                Some(target) => println!("Email:   {}", target.to()),
                None => println!("Email:   none"),
            }
            println!("OK");
        }

        Commands::Submit { form_id, data, ip, user_agent } => {
            let body = read_body(data)?;
            let pipeline = build_pipeline(&config, home);
            let meta = SubmissionMeta {
                ip: ip.clone(),
                user_agent: user_agent.clone(),
            };

            let outcome = pipeline.submit(form_id, &body, &meta);
            println!("{}", serde_json::to_string_pretty(&outcome)?);

            if !outcome.accepted {
                std::process::exit(1);
            }
        }

        // ====================================================================
        // RESPONSES
        // ====================================================================

        Commands::Token => {
            let pipeline = build_pipeline(&config, home);
            let tokens = pipeline
                .guard()
                .csrf()
                .ok_or_else(|| anyhow!("CSRF is disabled; run: gatecrash-forms config set security.require_csrf true"))?;
            let token = tokens
                .issue(chrono::Utc::now())
                .context("Failed to persist CSRF token")?;
            println!("{}", token);
        }

        Commands::Responses { action } => {
            let pipeline = build_pipeline(&config, home);
            let store = pipeline.store();

            match action {
                ResponsesAction::List { form_id } => {
                    let (key, format) = declared_storage(&pipeline, form_id)?;
                    let responses = store
                        .list(&key, format)
                        .with_context(|| format!("Failed to read responses for '{}'", form_id))?;
                    println!("{}", serde_json::to_string_pretty(&responses)?);
                }
                ResponsesAction::Count { form_id } => {
                    let (key, format) = declared_storage(&pipeline, form_id)?;
                    let count = store
                        .count(&key, format)
                        .with_context(|| format!("Failed to count responses for '{}'", form_id))?;
                    println!("{}", count);
                }
                ResponsesAction::Export { form_id, format: target } => {
                    let (key, source) = declared_storage(&pipeline, form_id)?;
                    let path = store
                        .export(&key, source, (*target).into())
                        .with_context(|| format!("Failed to export responses for '{}'", form_id))?;
                    println!("Exported: {:?}", path);
                }
                ResponsesAction::Purge { form_id, yes } => {
                    if !yes {
                        return Err(anyhow!("Refusing to purge '{}' without --yes", form_id));
                    }
                    let (key, _) = declared_storage(&pipeline, form_id)?;
                    let removed = store
                        .purge(&key)
                        .with_context(|| format!("Failed to purge responses for '{}'", form_id))?;
                    println!("Removed {} artifact(s) for '{}'", removed, form_id);
                }
            }
        }

        Commands::Forms => {
            let pipeline = build_pipeline(&config, home);
            let registry = pipeline.registry();
            let ids = registry
                .list()
                .with_context(|| format!("Failed to list forms in {:?}", registry.dir()))?;
            if ids.is_empty() {
                println!("No forms in {:?}", registry.dir());
            }
            for id in ids {
                println!("{}", id);
            }
        }

        // ====================================================================
        // CONFIG
        // ====================================================================

        Commands::Config { action } => match action {
            ConfigAction::Set { key, value } => {
                match GlobalConfig::set_key(&config_path, key, value)? {
                    Some(_) => println!("Set {} in {:?}", key, config_path),
                    None => println!(
                        "Set {} in {:?} (config incomplete until remaining required keys are set)",
                        key, config_path
                    ),
                }
            }
            ConfigAction::Show => {
                let mut shown = config.clone();
                if let Some(smtp) = shown.smtp.as_mut() {
                    if !smtp.auth.pass.is_empty() {
                        smtp.auth.pass = "********".to_string();
                    }
                }
                println!("# {:?}", config_path);
                println!("{}", serde_json::to_string_pretty(&shown)?);
            }
        },
    }

    Ok(())
}
