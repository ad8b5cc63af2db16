use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use pestma_lib::config;
use pestma_lib::pipeline::diagnosis::{
    adjusted_confidence, save_run, AnalysisRun, DiagnosisPipeline, OllamaClient, StageKind,
};
use pestma_lib::pipeline_config::PipelineConfig;

#[derive(Debug, Parser)]
#[command(name = "pestma", version, about = "Multi-agent plant diagnosis over local Ollama models")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Diagnose a plant problem: diagnoser, peer review, then advice.
    Analyze {
        /// Free-text description of the symptoms.
        problem: String,

        /// Photo of the affected plant.
        #[arg(long)]
        image: Option<PathBuf>,

        /// JSON stage table (see `print-config`). Defaults to the built-in roster.
        #[arg(long, env = "PESTMA_CONFIG")]
        config: Option<PathBuf>,

        /// Run every stage on this one model.
        #[arg(long)]
        model: Option<String>,

        /// Save the run under the data directory (or this directory).
        #[arg(long, value_name = "DIR")]
        save: Option<Option<PathBuf>>,

        /// Print the full run as JSON instead of a report.
        #[arg(long)]
        json: bool,
    },

    /// Print the default stage table as JSON.
    PrintConfig,

    /// Check that Ollama is reachable and the configured models are installed.
    Check {
        #[arg(long, env = "PESTMA_CONFIG")]
        config: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<ExitCode> {
    pestma_lib::init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Analyze {
            problem,
            image,
            config: config_path,
            model,
            save,
            json,
        } => {
            if problem.trim().is_empty() {
                bail!("problem description is empty");
            }
            if let Some(path) = &image {
                if !path.is_file() {
                    bail!("image not found: {}", path.display());
                }
            }

            let mut table = load_config(config_path.as_deref())?;
            if let Some(model) = &model {
                table = table.with_single_model(model);
            }

            let client = OllamaClient::from_env().context("building Ollama client")?;
            let pipeline = DiagnosisPipeline::new(Arc::new(client), table);
            let run = pipeline.analyze(&problem, image.as_deref());

            if json {
                println!("{}", serde_json::to_string_pretty(&run)?);
            } else {
                print_report(&run);
            }

            if let Some(dir) = save {
                let dir = dir.unwrap_or_else(config::analyses_dir);
                let path = save_run(&run, &dir).context("saving analysis")?;
                eprintln!("Saved to {}", path.display());
            }

            Ok(if run.is_aborted() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            })
        }
        Commands::PrintConfig => {
            println!("{}", serde_json::to_string_pretty(&PipelineConfig::default())?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Check {
            config: config_path,
        } => {
            let table = load_config(config_path.as_deref())?;
            let client = OllamaClient::from_env()?;
            let installed = client
                .list_models()
                .with_context(|| format!("querying {}", client.base_url()))?;

            println!("Ollama reachable at {}", client.base_url());
            let mut missing = 0;
            for kind in StageKind::ALL {
                let model = &table.stage(kind).model;
                let found = installed.iter().any(|m| m.starts_with(model.as_str()));
                if !found {
                    missing += 1;
                }
                println!(
                    "  {kind:<10} {model:<28} {}",
                    if found { "ok" } else { "missing" }
                );
            }
            Ok(if missing == 0 {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<PipelineConfig> {
    match path {
        Some(path) => PipelineConfig::from_file(path)
            .with_context(|| format!("loading pipeline config {}", path.display())),
        None => Ok(PipelineConfig::default()),
    }
}

fn print_report(run: &AnalysisRun) {
    println!("Problem: {}", run.metadata.problem);
    println!(
        "Image:   {}",
        run.metadata
            .image
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "none".into())
    );
    println!();

    for (kind, status) in run.stage_statuses() {
        println!("  {kind:<10} {status}");
    }
    println!("  total      {:.1}s", run.metadata.total_time.as_secs_f64());
    println!();

    if run.is_aborted() {
        println!(
            "Analysis aborted: {}",
            run.diagnoser.error_detail.as_deref().unwrap_or("diagnoser failed")
        );
        return;
    }

    if let Some(d) = run.diagnosis() {
        println!(
            "Diagnosis:   {} ({}/10), alternative {} ({}/10)",
            d.primary_diagnosis, d.primary_confidence, d.alternative_diagnosis, d.alternative_confidence
        );
        println!("Image/text:  {}", d.image_text_correlation);
        if let Some(v) = run.validation() {
            println!(
                "Review:      {} (confidence {}/10 after adjustment {:+})",
                v.final_recommendation,
                adjusted_confidence(d, v),
                v.primary_confidence_adjustment
            );
            if v.final_recommendation.is_critical() {
                println!("             flagged for closer attention");
            }
        }
    }
    println!();

    match run.advice() {
        Some(advice) => println!("{advice}"),
        None => println!("No advice: the advisor did not answer."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn analyze_flags_parse() {
        let cli = Cli::try_parse_from([
            "pestma",
            "analyze",
            "white powdery spots on leaves",
            "--image",
            "leaf.jpg",
            "--save",
            "--json",
        ])
        .unwrap();
        match cli.command {
            Commands::Analyze {
                problem,
                image,
                save,
                json,
                ..
            } => {
                assert_eq!(problem, "white powdery spots on leaves");
                assert_eq!(image, Some(PathBuf::from("leaf.jpg")));
                assert_eq!(save, Some(None));
                assert!(json);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn save_accepts_directory() {
        let cli = Cli::try_parse_from(["pestma", "analyze", "rot", "--save", "/tmp/out"]).unwrap();
        match cli.command {
            Commands::Analyze { save, .. } => {
                assert_eq!(save, Some(Some(PathBuf::from("/tmp/out"))));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn problem_is_required() {
        assert!(Cli::try_parse_from(["pestma", "analyze"]).is_err());
    }
}
