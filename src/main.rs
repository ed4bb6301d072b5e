mod cli;

use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use console::Style;
use rust_decimal_macros::dec;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command};
use suprimento::assist;
use suprimento::collab::{LocalStorage, MemoryNotifier};
use suprimento::config::SuprimentoConfig;
use suprimento::custody::DocumentKind;
use suprimento::drafts::DraftCache;
use suprimento::engine::ProcessEngine;
use suprimento::ledger::{ExpenseDraft, GdrReturn};
use suprimento::state_machine::{Actor, NewProcess, ProcessStatus, Role};
use suprimento::store::{MemoryStore, Store};
use suprimento::ui::{self, StepProgress};

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("suprimento=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("suprimento=info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = SuprimentoConfig::load_from(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;

    match cli.command {
        Command::Demo => run_demo(&config).await,
        Command::Drafts { discard } => {
            let cache = DraftCache::open(&config.draft_dir, config.draft_debounce()).await?;
            if let Some(id) = discard {
                if cache.discard(id).await? {
                    println!("Rascunho {id} descartado.");
                } else {
                    println!("Nenhum rascunho para {id}.");
                }
                return Ok(());
            }
            ui::print_drafts(&cache.list_unsynced().await?);
            Ok(())
        }
        Command::Status => {
            print_status(&cli.config, &config);
            Ok(())
        }
    }
}

fn print_status(path: &Path, config: &SuprimentoConfig) {
    let bold = Style::new().bold();
    println!("{} {}", bold.apply_to("Configuração:"), path.display());
    println!("  prazo da prestação de contas: {} dias", config.accountability_deadline_days);
    println!("  tolerância de saldo:          {}", config.balance_epsilon);
    println!("  debounce de rascunhos:        {} ms", config.draft_debounce_ms);
    println!("  diretório de rascunhos:       {}", config.draft_dir.display());
    println!("  página da auditoria:          {}", config.audit_page_size);
    println!("  processo parado após:         {} dias", config.stale_threshold_days);
    println!("  modelo do assistente:         {}", config.assistant_model);
    let key = if config.api_key.is_empty() { "não configurada" } else { "configurada" };
    println!("  chave da API:                 {key}");
}

async fn run_demo(config: &SuprimentoConfig) -> Result<()> {
    let drafts = DraftCache::open(&config.draft_dir, config.draft_debounce()).await?;
    let engine = ProcessEngine::new(MemoryStore::new(), MemoryNotifier::new(), config.engine_settings())
        .with_drafts(drafts);
    let storage = LocalStorage::new(std::env::temp_dir().join("suprimento-demo"));

    let requester = Actor::new("Ana Souza", "ana.souza@tjpa.jus.br", Role::Requester);
    let manager = Actor::new("Carlos Lima", "carlos.lima@tjpa.jus.br", Role::Manager);
    let sosfu = Actor::new("Analista SOSFU", "sosfu@tjpa.jus.br", Role::Sosfu);
    let sefin = Actor::new("Ordenador SEFIN", "sefin@tjpa.jus.br", Role::Sefin);

    let progress = StepProgress::start("Criando solicitação");
    let process = engine
        .submit_request(
            &requester,
            NewProcess {
                beneficiary: requester.name.clone(),
                unit: "Comarca de Marabá".into(),
                granted_value: dec!(1000.00),
                justification: "Despesas miúdas de pronto pagamento da comarca".into(),
                manager_name: manager.name.clone(),
                manager_email: Some(manager.email.clone()),
                event_start: None,
                event_end: None,
            },
        )
        .await?;
    progress.done(&process);
    let id = process.id;

    progress.step("Encaminhando ao gestor");
    let process = engine
        .transition_process(id, ProcessStatus::Pending, ProcessStatus::WaitingManager, &requester, None)
        .await?;
    progress.done(&process);

    progress.step("Gestor assina a minuta de atesto");
    let minuta = engine
        .custody()
        .create_draft(
            id,
            DocumentKind::Attestation,
            DocumentKind::Attestation.label(),
            "Atesto a necessidade da despesa.",
            &requester,
        )
        .await?;
    match engine.sign_document(minuta.id, &manager).await?.advanced {
        Some(process) => progress.done(&process),
        None => progress.fail("a assinatura não encaminhou o processo"),
    }

    progress.step("Análise SOSFU");
    let process = engine
        .transition_process(
            id,
            ProcessStatus::WaitingSosfuAnalysis,
            ProcessStatus::WaitingSosfuExecution,
            &sosfu,
            None,
        )
        .await?;
    progress.done(&process);

    progress.step("Execução orçamentária");
    let custody = engine.custody();
    for (kind, number) in [
        (DocumentKind::CommitmentNote, "2026NE000123"),
        (DocumentKind::LiquidationNote, "2026DL000123"),
        (DocumentKind::PaymentOrder, "2026OB000123"),
    ] {
        custody
            .register_execution_document(id, kind, number, process.granted_value, &sosfu)
            .await?;
    }
    for doc in custody.documents(id).await?.into_iter().filter(|d| d.is_draft()) {
        engine.sign_document(doc.id, &sefin).await?;
    }
    let process = engine
        .transition_process(
            id,
            ProcessStatus::WaitingSosfuExecution,
            ProcessStatus::WaitingSosfuPayment,
            &sefin,
            None,
        )
        .await?;
    progress.done(&process);

    progress.step("Pagamento");
    progress.done(&engine.confirm_payment(id, &sosfu).await?);
    progress.done(&engine.confirm_receipt(id, &requester).await?);

    progress.step("Prestação de contas");
    let accountability = engine
        .store()
        .find_accountability(id)
        .await?
        .context("accountability was not opened on receipt")?;
    let ledger = engine.ledger();
    ledger
        .add_item(
            accountability.id,
            ExpenseDraft {
                date: Some(Utc::now().date_naive()),
                description: "Material de expediente".into(),
                supplier: "Papelaria Central".into(),
                doc_type: "NF".into(),
                doc_number: "881".into(),
                value: Some(dec!(500.00)),
                element: "3.3.90.30".into(),
                receipt: None,
            },
            &requester,
        )
        .await?;
    let receipt = custody
        .attach_upload(&storage, id, "recibo-servico.jpg", b"recibo", &requester)
        .await?
        .attachment
        .context("upload returned no storage reference")?;
    let typed = ExpenseDraft {
        date: Some(Utc::now().date_naive()),
        description: "Reparo elétrico".into(),
        supplier: "João Silva".into(),
        doc_type: "Recibo".into(),
        doc_number: "12".into(),
        value: Some(dec!(300.00)),
        element: "3.3.90.36".into(),
        receipt: Some(receipt.clone()),
    };
    let form = match assist::configured_reader(config)? {
        Some(reader) => {
            progress.step("Lendo o comprovante");
            assist::complete_expense(&reader, requester.role, &receipt, typed).await
        }
        None => typed,
    };
    ledger.add_item(accountability.id, form, &requester).await?;
    let totals = ledger.totals(accountability.id).await?;
    let proof = custody
        .attach_upload(&storage, id, "comprovante-gdr.pdf", b"%PDF", &requester)
        .await?
        .attachment;
    ledger
        .submit(
            accountability.id,
            &requester,
            Some(GdrReturn {
                number: "GDR-2026-000045".into(),
                paid_on: Utc::now().date_naive(),
                proof,
            }),
        )
        .await?;
    ledger.attest(accountability.id, &manager).await?;
    ledger.approve(accountability.id, &sosfu).await?;

    progress.step("Arquivamento");
    let process = engine
        .archive(id, &sosfu, "2026NL000987", Utc::now().date_naive())
        .await?;
    progress.done(&process);
    progress.finish();

    println!(
        "\n  Gasto {}  Retido {}  Devolvido {}",
        totals.spent, totals.withheld, totals.balance
    );
    ui::print_reconciliation(&engine.reconcile(id).await?);
    ui::print_timeline(&engine.audit_trail(id).await?);
    Ok(())
}
