use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    domain::{ConnectionId, FunnelId, StepId},
    error::DateRangeError,
};

/// Every backend payload arrives wrapped in a `data` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataEnvelope<T> {
    pub data: T,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunnelStep {
    pub id: StepId,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl FunnelStep {
    pub fn new(id: StepId) -> Self {
        Self {
            id,
            attributes: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunnelPivot {
    #[serde(default)]
    pub disabled_steps: Option<Vec<StepId>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Funnel {
    pub id: FunnelId,
    pub connection_id: ConnectionId,
    #[serde(default)]
    pub steps: Vec<FunnelStep>,
    #[serde(default)]
    pub pivot: FunnelPivot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<Report>,
}

impl Funnel {
    pub fn disabled_steps(&self) -> Option<&[StepId]> {
        self.pivot.disabled_steps.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportStep {
    pub id: StepId,
    #[serde(default)]
    pub users: u64,
    #[serde(
        rename = "conversionRate",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub conversion_rate: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ReportStep {
    pub fn new(id: StepId, users: u64) -> Self {
        Self {
            id,
            users,
            conversion_rate: None,
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Report {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub steps: Vec<ReportStep>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DateRange {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

impl DateRange {
    pub fn new(start_date: NaiveDate, end_date: NaiveDate) -> Result<Self, DateRangeError> {
        if start_date > end_date {
            return Err(DateRangeError {
                start_date,
                end_date,
            });
        }
        Ok(Self {
            start_date,
            end_date,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunnelReportRequest {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub steps: Vec<FunnelStep>,
}

impl FunnelReportRequest {
    pub fn new(range: DateRange, steps: Vec<FunnelStep>) -> Self {
        Self {
            start_date: range.start_date,
            end_date: range.end_date,
            steps,
        }
    }
}
