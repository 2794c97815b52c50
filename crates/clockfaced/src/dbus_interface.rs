use chrono::NaiveDate;
use clockface_core::types::is_valid_employee_id;
use clockface_core::{matcher, TemplateSource};
use serde_json::json;
use std::sync::Arc;
use zbus::interface;

use crate::config::Config;
use crate::engine::{Capture, EngineError, EngineHandle, Recognition};
use crate::store::{NewEmployee, Store, StoreError};

/// Number of recent match scores used for threshold recommendation.
const RECOMMEND_WINDOW: u32 = 1000;

/// Days covered by `Report` when no start date is given.
const REPORT_DAYS: i64 = 30;

/// Shared state accessible by D-Bus method handlers.
pub struct AppState {
    pub config: Config,
    pub engine: EngineHandle,
    pub store: Store,
}

/// D-Bus interface for the Clockface attendance daemon.
///
/// Bus name: org.clockface.Clockface1
/// Object path: /org/clockface/Clockface1
pub struct ClockfaceService {
    pub state: Arc<AppState>,
}

fn engine_error(e: EngineError) -> zbus::fdo::Error {
    match e {
        EngineError::Decode(_) | EngineError::Liveness(_) | EngineError::Match(_) => {
            tracing::warn!(error = %e, "rejected request");
            zbus::fdo::Error::InvalidArgs(e.to_string())
        }
        other => {
            tracing::error!(error = %other, "engine failure");
            zbus::fdo::Error::Failed(other.to_string())
        }
    }
}

fn store_error(e: StoreError) -> zbus::fdo::Error {
    tracing::error!(error = %e, "store failure");
    zbus::fdo::Error::Failed(e.to_string())
}

fn now() -> chrono::DateTime<chrono::FixedOffset> {
    chrono::Local::now().into()
}

/// Parse `YYYY-MM-DD`; empty means `default`.
fn parse_date(raw: &str, default: NaiveDate) -> zbus::fdo::Result<NaiveDate> {
    if raw.is_empty() {
        return Ok(default);
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("invalid date '{raw}': {e}")))
}

fn failure(message: &str) -> String {
    json!({ "success": false, "message": message }).to_string()
}

#[interface(name = "org.clockface.Clockface1")]
impl ClockfaceService {
    /// Enroll an employee from a face image.
    ///
    /// Returns the quality score of the enrollment image.
    async fn enroll(
        &self,
        employee_id: &str,
        name: &str,
        department: &str,
        image: Vec<u8>,
    ) -> zbus::fdo::Result<f64> {
        tracing::info!(employee_id, "enroll requested");

        if !is_valid_employee_id(employee_id) {
            return Err(zbus::fdo::Error::InvalidArgs(format!(
                "invalid employee id '{employee_id}': expected 3-20 characters of [A-Za-z0-9_-]"
            )));
        }
        if name.trim().is_empty() {
            return Err(zbus::fdo::Error::InvalidArgs("name must not be empty".into()));
        }

        let (embedding, quality) = match self.state.engine.capture(image).await.map_err(engine_error)? {
            Capture::Face {
                embedding,
                liveness,
                quality,
            } => {
                tracing::debug!(employee_id, liveness = liveness.score, quality, "enroll: face captured");
                (embedding, quality)
            }
            Capture::Spoof(v) => {
                tracing::warn!(employee_id, score = v.score, "enroll: liveness check failed");
                return Err(zbus::fdo::Error::Failed(
                    "liveness check failed; use a live face".into(),
                ));
            }
            Capture::NoFace => {
                return Err(zbus::fdo::Error::Failed("no face detected in image".into()));
            }
        };

        let employee = NewEmployee {
            employee_id: employee_id.to_string(),
            name: name.trim().to_string(),
            department: department.trim().to_string(),
        };
        let inserted = self
            .state
            .store
            .enroll(&employee, &embedding, quality)
            .await
            .map_err(store_error)?;
        if !inserted {
            return Err(zbus::fdo::Error::Failed(format!(
                "employee '{employee_id}' is already enrolled"
            )));
        }

        tracing::info!(employee_id, quality, "enrolled successfully");
        Ok(quality as f64)
    }

    /// Recognize the face in `image` and record the next in/out event.
    ///
    /// Returns JSON `{success, message, employee_id?, confidence?, event?}`.
    async fn mark_attendance(&self, image: Vec<u8>) -> zbus::fdo::Result<String> {
        let registry = self.state.store.load_registry().await.map_err(store_error)?;
        let gallery = registry.active_templates();
        if gallery.is_empty() {
            return Ok(failure("No employees enrolled"));
        }

        let found = match self
            .state
            .engine
            .recognize(image, gallery)
            .await
            .map_err(engine_error)?
        {
            Recognition::Matched(found) => found,
            Recognition::Spoof(v) => {
                tracing::warn!(score = v.score, "attendance: liveness check failed");
                return Ok(failure("Liveness check failed. Please use a live face."));
            }
            Recognition::NoFace => return Ok(failure("No face detected")),
            Recognition::Unrecognized => return Ok(failure("Face not recognized")),
        };

        let outcome = self
            .state
            .store
            .record_attendance(
                &found.employee_id,
                now(),
                Some(found.score),
                self.state.config.cooldown(),
            )
            .await
            .map_err(store_error)?;

        Ok(json!({
            "success": outcome.ok,
            "message": outcome.message,
            "employee_id": found.employee_id,
            "confidence": found.score,
            "event": outcome.event,
        })
        .to_string())
    }

    /// Check `image` against one employee's template.
    async fn verify(&self, employee_id: &str, image: Vec<u8>) -> zbus::fdo::Result<(bool, f64)> {
        let registry = self.state.store.load_registry().await.map_err(store_error)?;
        let candidate = registry.active_template(employee_id);
        let v = self
            .state
            .engine
            .verify(image, candidate)
            .await
            .map_err(engine_error)?;
        tracing::info!(employee_id, matched = v.matched, score = v.score, "verify completed");
        Ok((v.matched, v.score as f64))
    }

    async fn score_liveness(&self, image: Vec<u8>) -> zbus::fdo::Result<(bool, f64)> {
        let v = self
            .state
            .engine
            .score_liveness(image)
            .await
            .map_err(engine_error)?;
        Ok((v.is_real, v.score as f64))
    }

    /// Events for `employee_id` on `date` (`YYYY-MM-DD`, empty for today).
    async fn day_record(&self, employee_id: &str, date: &str) -> zbus::fdo::Result<String> {
        let date = parse_date(date, now().date_naive())?;
        let events = self
            .state
            .store
            .day_record(employee_id, date)
            .await
            .map_err(store_error)?;
        serde_json::to_string(&events).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Events of every employee dated `from..=to`, newest first.
    ///
    /// Empty `to` means today; empty `from` means 30 days before `to`.
    async fn report(&self, from: &str, to: &str) -> zbus::fdo::Result<String> {
        let to = parse_date(to, now().date_naive())?;
        let from = parse_date(from, to - chrono::Duration::days(REPORT_DAYS))?;
        if from > to {
            return Err(zbus::fdo::Error::InvalidArgs(format!(
                "report range is reversed: {from} is after {to}"
            )));
        }
        let rows = self
            .state
            .store
            .records_between(from, to)
            .await
            .map_err(store_error)?;
        tracing::info!(%from, %to, events = rows.len(), "report generated");
        serde_json::to_string(&rows).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    async fn list_employees(&self) -> zbus::fdo::Result<String> {
        let employees = self.state.store.list_employees().await.map_err(store_error)?;
        serde_json::to_string(&employees).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    async fn deactivate(&self, employee_id: &str) -> zbus::fdo::Result<bool> {
        let changed = self
            .state
            .store
            .deactivate(employee_id)
            .await
            .map_err(store_error)?;
        tracing::info!(employee_id, changed, "deactivate requested");
        Ok(changed)
    }

    async fn set_liveness_threshold(&self, threshold: f64) -> zbus::fdo::Result<()> {
        self.state
            .engine
            .set_liveness_threshold(threshold as f32)
            .await
            .map_err(engine_error)
    }

    /// Turn the liveness gate on or off at runtime.
    async fn set_liveness_enabled(&self, enabled: bool) -> zbus::fdo::Result<()> {
        if !enabled {
            tracing::warn!("liveness detection disabled over D-Bus");
        }
        self.state
            .engine
            .set_liveness_enabled(enabled)
            .await
            .map_err(engine_error)
    }

    async fn set_match_threshold(&self, threshold: f64) -> zbus::fdo::Result<()> {
        self.state
            .engine
            .set_match_threshold(threshold as f32)
            .await
            .map_err(engine_error)
    }

    /// Suggested match threshold from recent match confidences.
    async fn recommend_threshold(&self) -> zbus::fdo::Result<f64> {
        let scores = self
            .state
            .store
            .recent_confidences(RECOMMEND_WINDOW)
            .await
            .map_err(store_error)?;
        Ok(matcher::recommend_threshold(&scores) as f64)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let engine = self.state.engine.status().await.map_err(engine_error)?;
        let employees = self.state.store.employee_counts().await.map_err(store_error)?;
        let events_today = self
            .state
            .store
            .count_events_on(now().date_naive())
            .await
            .map_err(store_error)?;

        Ok(json!({
            "version": env!("CARGO_PKG_VERSION"),
            "engine": engine,
            "total_employees": employees.total,
            "active_employees": employees.active,
            "events_today": events_today,
            "cooldown_secs": self.state.config.cooldown_secs,
            "session_bus": self.state.config.session_bus,
        })
        .to_string())
    }
}
