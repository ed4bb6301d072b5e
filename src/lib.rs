//! SUPRIMENTO: motor do ciclo de vida de processos de suprimento de fundos.
//!
//! O [`engine::ProcessEngine`] conduz a solicitação do pedido ao arquivamento;
//! o [`ledger::AccountabilityLedger`] cuida da prestação de contas; a custódia
//! de documentos, a conciliação e a trilha de auditoria completam o núcleo.
//! Armazenamento, notificações e leitura de comprovantes são colaboradores
//! atrás de traits.

pub mod assist;
pub mod audit;
pub mod collab;
pub mod config;
pub mod custody;
pub mod drafts;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod optimistic;
pub mod realtime;
pub mod reconciliation;
pub mod state_machine;
pub mod store;
pub mod ui;
