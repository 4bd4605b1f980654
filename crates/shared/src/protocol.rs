use std::fmt;

use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::domain::{AuthUser, Metadata, Session};

/// One result row of a view: plain column name to scalar value.
pub type Row = serde_json::Map<String, Value>;

/// The pre-aggregated remote views the dashboard reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum View {
    GeneralStatistics,
    MonthlyOperations,
    ExportsByCountry,
    TransportModeTotals,
    RecentOperations,
}

impl View {
    /// Launch order of a dashboard batch, which is also the order faults are
    /// reported in.
    pub const ALL: [View; 5] = [
        View::GeneralStatistics,
        View::MonthlyOperations,
        View::ExportsByCountry,
        View::TransportModeTotals,
        View::RecentOperations,
    ];

    pub fn name(self) -> &'static str {
        match self {
            View::GeneralStatistics => "vista_estadisticas_generales",
            View::MonthlyOperations => "vista_operaciones_por_mes",
            View::ExportsByCountry => "vista_exportaciones_por_pais",
            View::TransportModeTotals => "vista_medio_transporte",
            View::RecentOperations => "vista_operaciones_recientes",
        }
    }

    pub fn row_limit(self) -> Option<usize> {
        match self {
            View::GeneralStatistics => Some(10),
            View::MonthlyOperations => Some(12),
            View::ExportsByCountry => Some(10),
            View::TransportModeTotals => None,
            View::RecentOperations => Some(10),
        }
    }
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticsRow {
    #[serde(default, deserialize_with = "nullable_string")]
    pub tipo_operacion: String,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub total_operaciones: i64,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub paises_destino: i64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub valor_total_usd: f64,
    #[serde(flatten)]
    pub extra: Row,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportModeRow {
    #[serde(default)]
    pub medio_transporte: Option<String>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub total_operaciones: i64,
    #[serde(flatten)]
    pub extra: Row,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountryExportRow {
    #[serde(default, deserialize_with = "nullable_string")]
    pub nombre_del_pais_de_destino: String,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub valor_total_usd: f64,
    #[serde(flatten)]
    pub extra: Row,
}

#[derive(Debug, Clone, Serialize)]
pub struct PasswordGrantRequest<'a> {
    pub email: &'a str,
    pub password: &'a str,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshGrantRequest<'a> {
    pub refresh_token: &'a str,
}

#[derive(Debug, Clone, Serialize)]
pub struct SignUpRequest<'a> {
    pub email: &'a str,
    pub password: &'a str,
    pub data: &'a Metadata,
}

/// Session as issued by the token and sign-up endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub expires_at: Option<i64>,
    pub user: AuthUser,
}

impl TokenResponse {
    pub fn into_session(self, now_unix: i64) -> Session {
        let expires_at = self
            .expires_at
            .or_else(|| self.expires_in.map(|expires_in| now_unix + expires_in));
        Session {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at,
            user: self.user,
        }
    }
}

/// Outcome of a sign-up. Depending on whether the gateway auto-confirms new
/// identities it returns a full session, only the created user, or neither.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SignUpResponse {
    pub user: Option<AuthUser>,
    pub session: Option<Session>,
}

impl SignUpResponse {
    /// Decodes the sign-up body, which is either a session object (with an
    /// embedded user) or a bare user object.
    pub fn from_value(mut value: Value, now_unix: i64) -> Result<Self, serde_json::Error> {
        if value.get("access_token").is_some() {
            let token: TokenResponse = serde_json::from_value(value)?;
            let session = token.into_session(now_unix);
            return Ok(Self {
                user: Some(session.user.clone()),
                session: Some(session),
            });
        }

        if value.get("id").is_some_and(|id| !id.is_null()) {
            return Ok(Self {
                user: Some(serde_json::from_value(value)?),
                session: None,
            });
        }

        match value.get_mut("user").map(Value::take) {
            Some(user) if !user.is_null() => Ok(Self {
                user: Some(serde_json::from_value(user)?),
                session: None,
            }),
            _ => Ok(Self::default()),
        }
    }
}

fn nullable_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

fn lenient_i64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(0),
        Some(Value::Number(number)) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|value| value as i64))
            .ok_or_else(|| de::Error::custom(format!("integer out of range: {number}"))),
        Some(Value::String(raw)) if raw.trim().is_empty() => Ok(0),
        Some(Value::String(raw)) => raw
            .trim()
            .parse::<i64>()
            .or_else(|_| raw.trim().parse::<f64>().map(|value| value as i64))
            .map_err(|_| de::Error::custom(format!("invalid integer column value '{raw}'"))),
        Some(other) => Err(de::Error::custom(format!(
            "expected integer column, got {other}"
        ))),
    }
}

fn lenient_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(0.0),
        Some(Value::Number(number)) => number
            .as_f64()
            .ok_or_else(|| de::Error::custom(format!("number out of range: {number}"))),
        Some(Value::String(raw)) if raw.trim().is_empty() => Ok(0.0),
        Some(Value::String(raw)) => raw
            .trim()
            .parse::<f64>()
            .map_err(|_| de::Error::custom(format!("invalid numeric column value '{raw}'"))),
        Some(other) => Err(de::Error::custom(format!(
            "expected numeric column, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn statistics_row_reads_null_and_string_numbers_as_values() {
        let row: StatisticsRow = serde_json::from_value(json!({
            "tipo_operacion": "EXPORTACIONES DEFINITIVAS",
            "total_operaciones": "100",
            "paises_destino": null,
            "valor_total_usd": 1500.5,
            "anio": 2024
        }))
        .expect("row");

        assert_eq!(row.total_operaciones, 100);
        assert_eq!(row.paises_destino, 0);
        assert_eq!(row.valor_total_usd, 1500.5);
        assert_eq!(row.extra.get("anio"), Some(&json!(2024)));
    }

    #[test]
    fn transport_row_allows_missing_label() {
        let row: TransportModeRow =
            serde_json::from_value(json!({ "total_operaciones": 7 })).expect("row");
        assert_eq!(row.medio_transporte, None);
        assert_eq!(row.total_operaciones, 7);
    }

    #[test]
    fn sign_up_body_with_session_carries_user() {
        let response = SignUpResponse::from_value(
            json!({
                "access_token": "token",
                "refresh_token": "refresh",
                "expires_in": 3600,
                "user": {
                    "id": "3f2b8a52-5d0c-4c57-9a53-0f6f1b0a6e11",
                    "email": "ana@example.com",
                    "user_metadata": { "rol": "cliente" }
                }
            }),
            1_700_000_000,
        )
        .expect("decode");

        assert_eq!(
            response.session.as_ref().and_then(|session| session.expires_at),
            Some(1_700_003_600)
        );
        assert_eq!(
            response.user.map(|user| user.email),
            Some(Some("ana@example.com".to_string()))
        );
    }

    #[test]
    fn sign_up_body_without_session_or_user_is_empty() {
        let response = SignUpResponse::from_value(json!({ "user": null }), 0).expect("decode");
        assert_eq!(response, SignUpResponse::default());
    }

    #[test]
    fn sign_up_body_with_bare_user_has_no_session() {
        let response = SignUpResponse::from_value(
            json!({
                "id": "3f2b8a52-5d0c-4c57-9a53-0f6f1b0a6e11",
                "email": "ana@example.com",
                "user_metadata": {}
            }),
            0,
        )
        .expect("decode");

        assert!(response.session.is_none());
        assert!(response.user.is_some());
    }

    #[test]
    fn view_limits_match_dashboard_batch() {
        let limits: Vec<_> = View::ALL.iter().map(|view| view.row_limit()).collect();
        assert_eq!(limits, vec![Some(10), Some(12), Some(10), None, Some(10)]);
    }
}
