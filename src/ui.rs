//! Interface de terminal do SUPRIMENTO: spinners e saída colorida.
//!
//! Usa `indicatif` para o spinner de progresso e `console` para cores.
//! O [`StepProgress`] acompanha uma sequência de tramitações na demonstração.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::audit::{AuditEntry, AuditSource};
use crate::drafts::DraftEntry;
use crate::reconciliation::{ReconciliationReport, Verdict};
use crate::state_machine::Process;

/// Spinner com mensagens coloridas para cada etapa concluída.
pub struct StepProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
    dim: Style,
}

impl StepProgress {
    /// Inicia o spinner com a descrição da sequência.
    pub fn start(description: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
            pb.set_style(style);
        }
        pb.set_message(description.to_string());
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            dim: Style::new().dim(),
        }
    }

    pub fn step(&self, message: &str) {
        self.pb.set_message(message.to_string());
    }

    /// Registra uma etapa concluída acima do spinner.
    pub fn done(&self, process: &Process) {
        self.pb.println(format!(
            "  {} {} {}",
            self.green.apply_to("✓"),
            process.nup,
            self.dim.apply_to(process.status.label())
        ));
    }

    pub fn fail(&self, reason: &str) {
        self.pb.println(format!("  {} {reason}", self.red.apply_to("✗")));
    }

    pub fn finish(&self) {
        self.pb.finish_and_clear();
    }
}

fn source_style(source: AuditSource) -> Style {
    match source {
        AuditSource::Transition => Style::new().cyan(),
        AuditSource::Document => Style::new().magenta(),
        AuditSource::Change => Style::new().yellow(),
    }
}

/// Imprime a linha do tempo de auditoria, mais recente primeiro.
pub fn print_timeline(entries: &[AuditEntry]) {
    let header = Style::new().bold();
    println!();
    println!("{}", header.apply_to("─── Trilha de Auditoria ───"));
    for entry in entries {
        let style = source_style(entry.source);
        println!(
            "  {} {:<11} {:<16} {} {}",
            entry.timestamp.format("%d/%m/%Y %H:%M:%S"),
            style.apply_to(entry.source.label()),
            entry.action,
            entry.description,
            Style::new().dim().apply_to(format!("({})", entry.actor_name)),
        );
    }
}

fn verdict_style(verdict: Verdict) -> Style {
    match verdict {
        Verdict::Ok => Style::new().green().bold(),
        Verdict::Pending => Style::new().yellow(),
        Verdict::Mismatch => Style::new().red().bold(),
    }
}

pub fn print_reconciliation(report: &ReconciliationReport) {
    println!();
    println!("{}", Style::new().bold().apply_to("─── Conciliação da Execução ───"));
    for line in &report.lines {
        println!(
            "  {:<24} {:<14} {:>12} {}",
            line.kind.label(),
            line.number.as_deref().unwrap_or("-"),
            line.value.map(|v| v.to_string()).unwrap_or_else(|| "-".into()),
            if line.signed { "assinado" } else { "pendente" },
        );
    }
    let overall = report.overall();
    println!(
        "  Concedido: {}  Resultado: {}",
        report.granted,
        verdict_style(overall).apply_to(overall.label())
    );
}

pub fn print_drafts(entries: &[DraftEntry]) {
    if entries.is_empty() {
        println!("  Nenhum rascunho pendente.");
        return;
    }
    for entry in entries {
        println!(
            "  {} {} item(s), {} anexo(s), salvo em {}",
            Style::new().cyan().apply_to(entry.id),
            entry.items.len(),
            entry.attachments.len(),
            entry.updated_at.format("%d/%m/%Y %H:%M"),
        );
    }
}
