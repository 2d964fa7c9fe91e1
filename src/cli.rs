use clap::{Parser, Subcommand};

use crate::models::user::Role;

/// cil — API backend with token auth and background job queues
#[derive(Parser)]
#[command(name = "cil", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP server and queue workers
    Serve {
        /// Port to bind (defaults to PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Issue or inspect access tokens
    Token {
        #[command(subcommand)]
        command: TokenCommands,
    },

    /// Inspect and control job queues
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },
}

#[derive(Subcommand)]
pub enum TokenCommands {
    /// Issue an access/refresh token pair
    Issue {
        #[arg(long)]
        id: String,
        #[arg(long)]
        email: String,
        #[arg(long, default_value = "user")]
        role: Role,
    },
    /// Verify a token and print its claims
    Verify { token: String },
}

#[derive(Subcommand)]
pub enum QueueCommands {
    /// Print counts for every default queue
    Stats,
    /// Stop workers from picking up new jobs
    Pause { name: String },
    /// Let workers pick up jobs again
    Resume { name: String },
    /// Drop all waiting and delayed jobs
    Empty { name: String },
}
