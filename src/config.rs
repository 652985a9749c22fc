//! Configuração do forgeflow carregada a partir de `forgeflow.toml`.
//!
//! A struct [`ForgeConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! A variável de ambiente `FORGEFLOW_WORKPLAN_DIR` tem precedência sobre o
//! arquivo para o diretório de workplans.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::ForgeError;

/// Nome do arquivo procurado no diretório atual.
pub const CONFIG_FILE: &str = "forgeflow.toml";

/// Variável de ambiente que sobrescreve `workplan_dir`.
pub const WORKPLAN_DIR_ENV: &str = "FORGEFLOW_WORKPLAN_DIR";

/// Configuração de nível superior carregada de `forgeflow.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct ForgeConfig {
    /// Filtro do `tracing` quando `RUST_LOG` não está definido.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    /// Atraso de reconexão dos listeners, em milissegundos.
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// Intervalo mínimo entre duas entregas da fila com atraso.
    #[serde(default = "default_delay_queue_ms")]
    pub delay_queue_ms: u64,

    /// Diretório onde workplans e snapshots são persistidos.
    #[serde(default = "default_workplan_dir")]
    pub workplan_dir: PathBuf,

    /// Número de entradas dos joins criados pelo workplan de demonstração.
    #[serde(default = "default_join_inputs")]
    pub join_inputs: usize,
}

// Valor padrão para o filtro de log: "info".
fn default_log_filter() -> String {
    "info".to_string()
}

// Valor padrão para o atraso de reconexão: 500ms.
fn default_reconnect_delay_ms() -> u64 {
    500
}

// Valor padrão para o intervalo da fila: 100ms.
fn default_delay_queue_ms() -> u64 {
    100
}

fn default_workplan_dir() -> PathBuf {
    PathBuf::from("workplans")
}

// Joins esperam duas entradas, salvo configuração contrária.
fn default_join_inputs() -> usize {
    2
}

impl Default for ForgeConfig {
    fn default() -> Self {
        Self {
            log_filter: default_log_filter(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            delay_queue_ms: default_delay_queue_ms(),
            workplan_dir: default_workplan_dir(),
            join_inputs: default_join_inputs(),
        }
    }
}

impl ForgeConfig {
    /// Carrega a configuração de `forgeflow.toml` no diretório atual.
    /// Usa valores padrão se o arquivo não existir.
    pub fn load() -> Result<Self, ForgeError> {
        Self::load_from(Path::new(CONFIG_FILE))
    }

    /// Carrega a configuração de um caminho explícito.
    pub fn load_from(path: &Path) -> Result<Self, ForgeError> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .map_err(|e| ForgeError::Config(format!("{}: {e}", path.display())))?;
            toml::from_str::<ForgeConfig>(&contents)?
        } else {
            Self::default()
        };

        // Variável de ambiente tem precedência sobre o arquivo de configuração.
        if let Ok(dir) = std::env::var(WORKPLAN_DIR_ENV)
            && !dir.is_empty()
        {
            config.workplan_dir = PathBuf::from(dir);
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ForgeError> {
        if self.join_inputs < 2 {
            return Err(ForgeError::Config(format!(
                "join_inputs must be at least 2, got {}",
                self.join_inputs
            )));
        }
        Ok(())
    }
}
