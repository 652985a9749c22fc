//! Interface de linha de comando do forgeflow baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (validate, run, demo,
//! export-demo) e flags globais (--config, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// forgeflow: máquinas de estado e workplans para a execução da manufatura.
#[derive(Debug, Parser)]
#[command(name = "forgeflow", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho do arquivo de configuração (padrão: `forgeflow.toml`).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Valida e libera um workplan em JSON, reportando erros de integridade.
    Validate {
        /// Arquivo JSON do workplan.
        file: PathBuf,
    },

    /// Executa um workplan com o executor simulado.
    Run {
        /// Arquivo JSON do workplan.
        file: PathBuf,

        /// Passo (ou atividade) que deve reportar falha. Pode se repetir.
        #[arg(long = "fail", value_name = "STEP")]
        fail: Vec<String>,

        /// Nome do token inicial.
        #[arg(long, default_value = "unit-1")]
        token: String,

        /// Grava o snapshot final no diretório de workplans.
        #[arg(long, default_value_t = false)]
        save_snapshot: bool,
    },

    /// Executa o workplan de montagem embutido.
    Demo {
        /// Passo (ou atividade) que deve reportar falha. Pode se repetir.
        #[arg(long = "fail", value_name = "STEP")]
        fail: Vec<String>,
    },

    /// Grava o workplan de demonstração como JSON.
    ExportDemo {
        /// Arquivo de destino.
        file: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_run_subcommand() {
        let cli = Cli::parse_from([
            "forgeflow",
            "run",
            "assembly.json",
            "--fail",
            "Solder",
            "--fail",
            "Glue",
        ]);
        match cli.command {
            Command::Run {
                file,
                fail,
                token,
                save_snapshot,
            } => {
                assert_eq!(file, PathBuf::from("assembly.json"));
                assert_eq!(fail, ["Solder", "Glue"]);
                assert_eq!(token, "unit-1");
                assert!(!save_snapshot);
            }
            _ => panic!("expected Run command"),
        }
    }

    #[test]
    fn cli_parses_global_flags() {
        let cli = Cli::parse_from(["forgeflow", "--config", "line.toml", "--verbose", "demo"]);
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("line.toml")));
        assert!(matches!(cli.command, Command::Demo { ref fail } if fail.is_empty()));
    }

    #[test]
    fn cli_parses_export_demo() {
        let cli = Cli::parse_from(["forgeflow", "export-demo", "demo.json"]);
        match cli.command {
            Command::ExportDemo { file } => assert_eq!(file, PathBuf::from("demo.json")),
            _ => panic!("expected ExportDemo command"),
        }
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }
}
