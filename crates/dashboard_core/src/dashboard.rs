use std::sync::Arc;

use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde_json::Value;
use shared::{
    error::{FaultCode, GatewayFault},
    protocol::{CountryExportRow, Row, StatisticsRow, TransportModeRow, View},
};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::gateway::ViewGateway;

pub const EXPORTS_LABEL: &str = "EXPORTACIONES";
pub const REEXPORTS_LABEL: &str = "REEXPORTACIONES";
pub const PERSONAL_EFFECTS_LABEL: &str = "EFECTOS";
pub const MARITIME_LABEL: &str = "MARITIMO";
pub const LAND_LABEL: &str = "TERRESTRE";

/// Number of country rows shown as main markets.
pub const TOP_MARKETS: usize = 6;

#[derive(Debug, Clone, PartialEq, Error)]
#[error("failed to load data: {reason}")]
pub struct FetchFailed {
    /// Description of the first fault observed in the batch. Which view
    /// produced it is not reported.
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoadState {
    Loading,
    Ready(Arc<DashboardSnapshot>),
    Failed(String),
}

impl LoadState {
    pub fn snapshot(&self) -> Option<&Arc<DashboardSnapshot>> {
        match self {
            LoadState::Ready(snapshot) => Some(snapshot),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DashboardMetrics {
    pub total_operations: i64,
    pub total_countries: i64,
    pub monthly_average: i64,
    pub maritime_operations: i64,
    pub land_operations: i64,
    pub exports_value_usd: f64,
    pub exports_operations: i64,
}

impl DashboardMetrics {
    pub fn derive(statistics: &[StatisticsRow], transport: &[TransportModeRow]) -> Self {
        let matched = [
            find_statistics(statistics, EXPORTS_LABEL),
            find_statistics(statistics, REEXPORTS_LABEL),
            find_statistics(statistics, PERSONAL_EFFECTS_LABEL),
        ];
        let exports = matched[0];

        let total_operations = matched
            .iter()
            .map(|row| row.map_or(0, |row| row.total_operaciones))
            .fold(0, i64::saturating_add);
        let total_countries = matched
            .iter()
            .map(|row| row.map_or(0, |row| row.paises_destino))
            .max()
            .unwrap_or(0);

        Self {
            total_operations,
            total_countries,
            monthly_average: monthly_average(total_operations),
            maritime_operations: find_transport(transport, MARITIME_LABEL)
                .map_or(0, |row| row.total_operaciones),
            land_operations: find_transport(transport, LAND_LABEL)
                .map_or(0, |row| row.total_operaciones),
            exports_value_usd: exports.map_or(0.0, |row| row.valor_total_usd),
            exports_operations: exports.map_or(0, |row| row.total_operaciones),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransportShare {
    pub label: String,
    pub operations: i64,
    pub percent: f64,
}

/// One consistent result of a dashboard fetch. Never patched; the next fetch
/// replaces it.
#[derive(Debug, Clone, PartialEq)]
pub struct DashboardSnapshot {
    pub statistics: Vec<StatisticsRow>,
    pub monthly_operations: Vec<Row>,
    pub country_exports: Vec<CountryExportRow>,
    pub transport_modes: Vec<TransportModeRow>,
    pub recent_operations: Vec<Row>,
    pub metrics: DashboardMetrics,
}

impl DashboardSnapshot {
    pub fn new(
        statistics: Vec<StatisticsRow>,
        monthly_operations: Vec<Row>,
        country_exports: Vec<CountryExportRow>,
        transport_modes: Vec<TransportModeRow>,
        recent_operations: Vec<Row>,
    ) -> Self {
        let metrics = DashboardMetrics::derive(&statistics, &transport_modes);
        Self {
            statistics,
            monthly_operations,
            country_exports,
            transport_modes,
            recent_operations,
            metrics,
        }
    }

    pub fn top_markets(&self, count: usize) -> &[CountryExportRow] {
        &self.country_exports[..count.min(self.country_exports.len())]
    }

    /// Share of each transport mode in the total operation count, in percent.
    pub fn transport_shares(&self) -> Vec<TransportShare> {
        let total = self
            .transport_modes
            .iter()
            .map(|row| row.total_operaciones)
            .fold(0, i64::saturating_add);

        self.transport_modes
            .iter()
            .map(|row| TransportShare {
                label: row.medio_transporte.clone().unwrap_or_default(),
                operations: row.total_operaciones,
                percent: if total == 0 {
                    0.0
                } else {
                    row.total_operaciones as f64 * 100.0 / total as f64
                },
            })
            .collect()
    }
}

/// First row whose operation type contains `label`.
pub fn find_statistics<'a>(rows: &'a [StatisticsRow], label: &str) -> Option<&'a StatisticsRow> {
    rows.iter().find(|row| row.tipo_operacion.contains(label))
}

/// First row whose transport mode contains `label`. Rows without a mode
/// never match.
pub fn find_transport<'a>(
    rows: &'a [TransportModeRow],
    label: &str,
) -> Option<&'a TransportModeRow> {
    rows.iter().find(|row| {
        row.medio_transporte
            .as_deref()
            .is_some_and(|mode| mode.contains(label))
    })
}

/// `total / 12` rounded half up.
pub fn monthly_average(total_operations: i64) -> i64 {
    total_operations.saturating_add(6).div_euclid(12)
}

/// Fetches the five dashboard views as one batch and derives the summary
/// metrics.
///
/// `fetch_dashboard` must not be called again while a previous call is still
/// running; overlapping calls are not de-duplicated.
pub struct DashboardPipeline {
    gateway: Arc<dyn ViewGateway>,
    state: watch::Sender<LoadState>,
}

impl DashboardPipeline {
    pub fn new(gateway: Arc<dyn ViewGateway>) -> Self {
        let (state, _) = watch::channel(LoadState::Loading);
        Self { gateway, state }
    }

    pub fn state(&self) -> LoadState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<LoadState> {
        self.state.subscribe()
    }

    /// Queries all five views concurrently and waits for every one of them.
    /// A fault in any view fails the whole batch; no partial snapshot is
    /// produced.
    pub async fn fetch_dashboard(&self) -> Result<Arc<DashboardSnapshot>, FetchFailed> {
        self.state.send_replace(LoadState::Loading);

        let results = join_all(
            View::ALL
                .iter()
                .map(|&view| self.gateway.query(view, view.row_limit())),
        )
        .await;

        match assemble_snapshot(results) {
            Ok(snapshot) => {
                let snapshot = Arc::new(snapshot);
                info!(
                    "dashboard: loaded total_operations={} countries={}",
                    snapshot.metrics.total_operations, snapshot.metrics.total_countries
                );
                self.state
                    .send_replace(LoadState::Ready(Arc::clone(&snapshot)));
                Ok(snapshot)
            }
            Err(fault) => {
                let failed = FetchFailed {
                    reason: fault.message,
                };
                error!("dashboard: {failed}");
                self.state
                    .send_replace(LoadState::Failed(failed.to_string()));
                Err(failed)
            }
        }
    }

    /// Manual retry; same as a fresh fetch.
    pub async fn retry(&self) -> Result<Arc<DashboardSnapshot>, FetchFailed> {
        self.fetch_dashboard().await
    }
}

fn assemble_snapshot(
    results: Vec<Result<Vec<Row>, GatewayFault>>,
) -> Result<DashboardSnapshot, GatewayFault> {
    let mut first_fault = None;
    let mut batches = Vec::with_capacity(View::ALL.len());
    for (view, result) in View::ALL.iter().zip(results) {
        match result {
            Ok(rows) => batches.push(rows),
            Err(fault) => {
                warn!("dashboard: query failed view={view}: {fault}");
                first_fault.get_or_insert(fault);
            }
        }
    }
    if let Some(fault) = first_fault {
        return Err(fault);
    }

    let [statistics, monthly, countries, transport, recent]: [Vec<Row>; 5] =
        batches.try_into().map_err(|batches: Vec<Vec<Row>>| {
            GatewayFault::new(
                FaultCode::Internal,
                format!("incomplete dashboard batch: {} of 5 views", batches.len()),
            )
        })?;

    Ok(DashboardSnapshot::new(
        decode_rows(View::GeneralStatistics, statistics)?,
        monthly,
        decode_rows(View::ExportsByCountry, countries)?,
        decode_rows(View::TransportModeTotals, transport)?,
        recent,
    ))
}

fn decode_rows<T: DeserializeOwned>(view: View, rows: Vec<Row>) -> Result<Vec<T>, GatewayFault> {
    rows.into_iter()
        .map(|row| serde_json::from_value(Value::Object(row)))
        .collect::<Result<_, _>>()
        .map_err(|err| GatewayFault::decode(format!("invalid row in {view}: {err}")))
}

#[cfg(test)]
#[path = "tests/dashboard_tests.rs"]
mod tests;
