//! Inicialização do `tracing` para o binário.

use tracing_subscriber::EnvFilter;

use crate::error::ForgeError;

/// Escolhe o filtro efetivo: `--verbose` força `debug`, depois `RUST_LOG`,
/// por fim o valor do arquivo de configuração.
pub fn filter_directive(configured: &str, verbose: bool, rust_log: Option<&str>) -> String {
    if verbose {
        return "debug".to_string();
    }
    match rust_log {
        Some(env) if !env.trim().is_empty() => env.to_string(),
        _ => configured.to_string(),
    }
}

/// Instala o subscriber global escrevendo em stderr, para não misturar
/// logs com a saída do terminal.
pub fn init(configured: &str, verbose: bool) -> Result<(), ForgeError> {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let directive = filter_directive(configured, verbose, rust_log.as_deref());
    let filter = EnvFilter::try_new(&directive)
        .map_err(|e| ForgeError::Config(format!("invalid log filter `{directive}`: {e}")))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| ForgeError::Config(format!("logging already initialised: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbose_overrides_everything() {
        assert_eq!(filter_directive("warn", true, Some("trace")), "debug");
    }

    #[test]
    fn rust_log_beats_config() {
        assert_eq!(filter_directive("info", false, Some("forgeflow=trace")), "forgeflow=trace");
        assert_eq!(filter_directive("info", false, Some("  ")), "info");
        assert_eq!(filter_directive("warn", false, None), "warn");
    }
}
