use crate::telemetry::{SensorBoard, SensorObservation, SensorView};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use uuid::Uuid;

#[derive(Clone)]
pub struct HttpState {
    pub board: SensorBoard,
}

#[derive(Debug, Serialize)]
struct SensorSnapshot {
    id: Uuid,
    object_id: &'static str,
    name: &'static str,
    icon: &'static str,
    measurement: &'static str,
    field: &'static str,
    #[serde(flatten)]
    observation: SensorObservation,
}

impl From<&SensorView> for SensorSnapshot {
    fn from(view: &SensorView) -> Self {
        Self {
            id: view.id,
            object_id: view.descriptor.object_id,
            name: view.descriptor.display_name,
            icon: view.descriptor.icon,
            measurement: view.descriptor.measurement,
            field: view.descriptor.field,
            observation: view.current(),
        }
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn list_sensors(State(state): State<HttpState>) -> Json<Vec<SensorSnapshot>> {
    Json(state.board.iter().map(SensorSnapshot::from).collect())
}

async fn get_sensor(
    State(state): State<HttpState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SensorSnapshot>, (StatusCode, String)> {
    state
        .board
        .get(id)
        .map(|view| Json(SensorSnapshot::from(view)))
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("unknown sensor {id}")))
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/sensors", get(list_sensors))
        .route("/v1/sensors/{id}", get(get_sensor))
        .with_state(state)
}
