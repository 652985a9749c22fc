//! Interface de terminal do forgeflow: spinner e saída colorida.
//!
//! Usa `indicatif` para o spinner de progresso e `console` para as cores.
//! O [`InstanceProgress`] acompanha no terminal a execução de uma instância
//! e das instâncias aninhadas.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};
use uuid::Uuid;

use forgeflow::engine::{InstanceEvent, InstanceOutcome, InstanceSnapshot};
use forgeflow::error::EngineError;
use forgeflow::workplan::{NodeClassification, Workplan};

/// Indicador visual de progresso para uma instância de workplan.
///
/// Eventos da instância raiz aparecem sem recuo; eventos de instâncias
/// aninhadas são recuados e marcados com `↳`.
pub struct InstanceProgress {
    pb: ProgressBar,
    root: Uuid,
    green: Style,
    red: Style,
    yellow: Style,
    dim: Style,
}

impl InstanceProgress {
    /// Inicia o spinner com o nome do workplan.
    pub fn start(workplan: &Workplan, root: Uuid) -> Self {
        let pb = ProgressBar::new_spinner();
        // Template fixo; se o indicatif recusar, fica o spinner padrão.
        let style = ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        pb.set_style(style);
        pb.set_message(format!("{} v{}", workplan.name, workplan.version));
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            root,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
            dim: Style::new().dim(),
        }
    }

    fn prefix(&self, instance: Uuid) -> String {
        if instance == self.root {
            "  ".to_string()
        } else {
            format!("    {} ", self.dim.apply_to("↳"))
        }
    }

    /// Mostra um evento acima do spinner. Eventos de tokens só mudam a
    /// mensagem do spinner.
    pub fn event(&self, event: &InstanceEvent) {
        let prefix = self.prefix(event.instance());
        match event {
            InstanceEvent::TokenAdded { connector, .. } => {
                self.pb.set_message(format!("token at connector {connector}"));
            }
            InstanceEvent::TokenRemoved { .. } => {}
            InstanceEvent::TransitionFired {
                step,
                consumed,
                produced,
                ..
            } => {
                self.pb.println(format!(
                    "{prefix}{} step {step} fired ({consumed} in, {produced} out)",
                    self.dim.apply_to("·")
                ));
            }
            InstanceEvent::ActivityStarted { name, .. } => {
                self.pb.set_message(format!("running {name}"));
                self.pb
                    .println(format!("{prefix}{} {name}", self.yellow.apply_to("▶")));
            }
            InstanceEvent::ActivityCompleted { name, output, .. } => {
                self.pb.println(format!(
                    "{prefix}{} {name} → output {output}",
                    self.green.apply_to("✓")
                ));
            }
            InstanceEvent::Paused { .. } => {
                self.pb
                    .println(format!("{prefix}{} paused", self.yellow.apply_to("‖")));
            }
            InstanceEvent::Resumed { .. } => {
                self.pb
                    .println(format!("{prefix}{} resumed", self.yellow.apply_to("▶")));
            }
            InstanceEvent::Completed { outcome } => {
                self.pb.println(format!(
                    "{prefix}{} reached {} ({})",
                    self.dim.apply_to("■"),
                    outcome.name,
                    outcome.classification
                ));
            }
            InstanceEvent::Faulted { error, .. } => {
                self.pb
                    .println(format!("{prefix}{} fault: {error}", self.red.apply_to("✗")));
            }
            InstanceEvent::Aborted { .. } => {
                self.pb
                    .println(format!("{prefix}{} aborted", self.red.apply_to("✗")));
            }
        }
    }

    /// Finaliza o spinner e exibe o resultado da instância.
    ///
    /// Um `End` é mostrado em verde; `Failed` e saídas customizadas em
    /// amarelo; falhas fatais em vermelho.
    pub fn complete(&self, result: &Result<InstanceOutcome, EngineError>) {
        self.pb.finish_and_clear();
        match result {
            Ok(outcome) if outcome.classification == NodeClassification::End => {
                println!("  {} Finished at {}", self.green.apply_to("✓"), outcome.name);
            }
            Ok(outcome) => {
                println!(
                    "  {} Finished at {} ({})",
                    self.yellow.apply_to("!"),
                    outcome.name,
                    outcome.classification
                );
            }
            Err(err) => {
                println!("  {} Instance failed: {err}", self.red.apply_to("✗"));
            }
        }
    }
}

/// Imprime o snapshot final em JSON.
pub fn print_snapshot(snapshot: &InstanceSnapshot) {
    println!();
    println!("{}", Style::new().dim().apply_to("─── Snapshot ───"));
    println!(
        "{}",
        serde_json::to_string_pretty(snapshot).unwrap_or_default()
    );
}
