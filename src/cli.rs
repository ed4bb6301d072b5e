//! Interface de linha de comando do SUPRIMENTO baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (demo, drafts, status)
//! e flags globais (--config, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use uuid::Uuid;

/// SUPRIMENTO: ciclo de vida de processos de suprimento de fundos.
#[derive(Debug, Parser)]
#[command(name = "suprimento", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho do arquivo de configuração.
    #[arg(long, global = true, default_value = "suprimento.toml")]
    pub config: PathBuf,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Executa o ciclo completo de um processo sobre o armazenamento em memória.
    Demo,

    /// Lista os rascunhos locais ainda não sincronizados.
    Drafts {
        /// Descarta o rascunho da prestação de contas informada.
        #[arg(long)]
        discard: Option<Uuid>,
    },

    /// Mostra a configuração efetiva.
    Status,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_demo_with_defaults() {
        let cli = Cli::parse_from(["suprimento", "demo"]);
        assert!(matches!(cli.command, Command::Demo));
        assert_eq!(cli.config, PathBuf::from("suprimento.toml"));
        assert!(!cli.verbose);
    }

    #[test]
    fn cli_parses_global_flags() {
        let cli = Cli::parse_from(["suprimento", "--config", "/etc/suprimento.toml", "--verbose", "status"]);
        assert!(cli.verbose);
        assert_eq!(cli.config, PathBuf::from("/etc/suprimento.toml"));
        assert!(matches!(cli.command, Command::Status));
    }

    #[test]
    fn cli_parses_drafts_discard() {
        let id = Uuid::new_v4();
        let cli = Cli::parse_from(["suprimento", "drafts", "--discard", &id.to_string()]);
        match cli.command {
            Command::Drafts { discard } => assert_eq!(discard, Some(id)),
            _ => panic!("expected Drafts command"),
        }
    }

    #[test]
    fn cli_rejects_malformed_id() {
        assert!(Cli::try_parse_from(["suprimento", "drafts", "--discard", "abc"]).is_err());
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }
}
