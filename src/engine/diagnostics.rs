use std::fmt::Write;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::engine::request::{Query, QueryKind};

/// A single call made to a data source.
#[derive(Debug, Clone)]
pub struct Request {
    pub query: Query,
    pub start: Instant,
    pub end: Instant,
}

impl Request {
    pub fn duration(&self) -> Duration {
        self.end.saturating_duration_since(self.start)
    }
}

/// Every source call performed during one executor iteration.
#[derive(Debug, Clone, Default)]
pub struct Round {
    pub requests: Vec<Request>,
}

/// Accumulated trace of a run.
///
/// Returned by [`run_with_env`](crate::run_with_env) and attached to every
/// [`FetchError`](crate::FetchError). Rounds whose requests were all answered
/// from the cache are not recorded, since no I/O happened.
#[derive(Debug, Clone, Default)]
pub struct Env {
    rounds: Vec<Round>,
}

impl Env {
    pub fn rounds(&self) -> &[Round] {
        &self.rounds
    }

    pub(crate) fn evolve(&mut self, round: Round) {
        self.rounds.push(round);
    }

    /// Total number of source calls across all rounds.
    pub fn request_count(&self) -> usize {
        self.rounds.iter().map(|round| round.requests.len()).sum()
    }

    /// Wall time between the first call starting and the last one ending.
    pub fn total_duration(&self) -> Duration {
        let requests = || self.rounds.iter().flat_map(|round| &round.requests);

        let start = requests().map(|request| request.start).min();
        let end = requests().map(|request| request.end).max();

        match (start, end) {
            (Some(start), Some(end)) => end.saturating_duration_since(start),
            _ => Duration::ZERO,
        }
    }

    /// Serializable summary with timestamps relative to the first call.
    pub fn report(&self) -> EnvReport {
        let origin = self
            .rounds
            .iter()
            .flat_map(|round| &round.requests)
            .map(|request| request.start)
            .min();

        let offset = |at: Instant| {
            origin
                .map(|origin| at.saturating_duration_since(origin).as_micros() as f64 / 1000.0)
                .unwrap_or_default()
        };

        let rounds = self
            .rounds
            .iter()
            .map(|round| RoundReport {
                requests: round
                    .requests
                    .iter()
                    .map(|request| RequestReport {
                        source: request.query.source.to_string(),
                        batch: matches!(request.query.kind, QueryKind::Batch(_)),
                        ids: request.query.ids().iter().map(|id| id.to_string()).collect(),
                        start_ms: offset(request.start),
                        end_ms: offset(request.end),
                    })
                    .collect(),
            })
            .collect();

        EnvReport { rounds }
    }

    /// Renders the trace as a Mermaid Gantt chart, one section per round.
    pub fn render_mermaid(&self) -> String {
        let mut chart = String::new();
        // writing into a String cannot fail
        let _ = self.write_mermaid(&mut chart);
        chart
    }

    /// Writes the Mermaid Gantt chart of the trace into `f`.
    pub fn write_mermaid(&self, f: &mut impl Write) -> std::fmt::Result {
        let report = self.report();

        writeln!(f, "gantt")?;
        writeln!(f, "    dateFormat x")?;
        writeln!(f, "    axisFormat %L")?;

        for (index, round) in report.rounds.iter().enumerate() {
            writeln!(f, "    section Round {}", index + 1)?;

            for request in &round.requests {
                // Mermaid needs a positive width to draw the bar
                let start = request.start_ms.floor() as u64;
                let end = (request.end_ms.ceil() as u64).max(start + 1);
                let label = format!("{} [{}]", request.source, request.ids.join(", "))
                    .replace(':', "#colon;");

                writeln!(f, "    {label} :{start}, {end}")?;
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EnvReport {
    pub rounds: Vec<RoundReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoundReport {
    pub requests: Vec<RequestReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestReport {
    pub source: String,
    pub batch: bool,
    pub ids: Vec<String>,
    pub start_ms: f64,
    pub end_ms: f64,
}
