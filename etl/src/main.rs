use anyhow::Context;
use clap::{Arg, ArgMatches, Command};
use common::config::Settings;
use std::path::Path;
use std::process;

const DEFAULT_CONFIG: &str = "config/etl.toml";

#[tokio::main]
async fn main() {
    let matches = Command::new("ETL Pipeline Manager")
        .version("1.0")
        .about("Builds the star-schema tables from raw catalog and event records")
        .subcommand_required(true)
        .subcommand(
            Command::new("run")
                .about("Run the whole pipeline once")
                .arg(
                    Arg::new("config")
                        .short('c')
                        .long("config")
                        .value_name("FILE")
                        .help("Sets a custom config file"),
                )
                .arg(
                    Arg::new("input")
                        .short('i')
                        .long("input")
                        .value_name("LOCATION")
                        .help("Overrides storage.input_root"),
                )
                .arg(
                    Arg::new("output")
                        .short('o')
                        .long("output")
                        .value_name("LOCATION")
                        .help("Overrides storage.output_root"),
                ),
        )
        .get_matches();

    match matches.subcommand() {
        Some(("run", run_matches)) => {
            if let Err(e) = run(run_matches).await {
                eprintln!("ETL pipeline error: {:#}", e);
                process::exit(1);
            }
        }
        _ => {
            eprintln!("Please specify a valid subcommand");
            process::exit(1);
        }
    }
}

async fn run(matches: &ArgMatches) -> anyhow::Result<()> {
    let settings = load_settings(matches)?;
    etl::logging::init_subscriber(&settings.logging)?;

    let report = etl::run_etl_pipeline(&settings)
        .await
        .context("pipeline run failed")?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn load_settings(matches: &ArgMatches) -> anyhow::Result<Settings> {
    let explicit = matches.get_one::<String>("config").map(|s| s.as_str());
    // The default file is optional when both roots come from flags or env.
    let config_path =
        explicit.or_else(|| Path::new(DEFAULT_CONFIG).exists().then_some(DEFAULT_CONFIG));

    let mut overrides = Vec::new();
    if let Some(input) = matches.get_one::<String>("input") {
        overrides.push(("storage.input_root", input.clone()));
    }
    if let Some(output) = matches.get_one::<String>("output") {
        overrides.push(("storage.output_root", output.clone()));
    }

    Settings::load(config_path, &overrides).with_context(|| {
        format!(
            "failed to load settings from {}",
            config_path.unwrap_or("environment")
        )
    })
}
