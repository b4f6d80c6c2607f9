//! CLI type definitions
//!
//! This module contains the top-level clap structures. Each command's own
//! arguments live next to its implementation in `commands`.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use super::commands::{repair::RepairArgs, run::RunArgs, runs::RunsArgs, serve::ServeArgs};

#[derive(Parser, Debug)]
#[command(name = "rehearse")]
#[command(about = "Rehearse - simulate, score and repair conversational agents", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output in JSON format
    #[arg(short, long, global = true)]
    pub json: bool,

    /// Configuration file (defaults to .rehearse/config.yaml and .rehearse/local.yaml)
    #[arg(short, long, global = true, env = "REHEARSE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Debug-level logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run test cases against an agent and stream progress
    Run(RunArgs),

    /// Inspect and manage stored runs
    Runs(RunsArgs),

    /// Diagnose a failing test and iterate on prompt fixes
    Repair(RepairArgs),

    /// Serve an agent over HTTP with live progress over WebSocket
    Serve(ServeArgs),
}
