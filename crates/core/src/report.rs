//! End-of-call report (EOCR) sent by the call provider's webhook.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::error::DomainError;
use crate::id::ProviderCallId;
use crate::restaurant::EnrichmentStatus;

/// Ended reason reported when the restaurant hung up after a normal conversation.
pub const CUSTOMER_ENDED_CALL: &str = "customer-ended-call";

/// Webhook envelope: `{ "message": { ... } }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndOfCallReport {
    pub message: ReportMessage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportMessage {
    pub call: ReportCall,
    #[serde(default)]
    pub ended_reason: String,
    #[serde(default)]
    pub analysis: ReportAnalysis,
    #[serde(default)]
    pub artifact: ReportArtifact,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportCall {
    pub id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportAnalysis {
    #[serde(default)]
    pub summary: String,
    /// The provider sends either a boolean or a string here.
    #[serde(default)]
    pub success_evaluation: JsonValue,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportArtifact {
    #[serde(default)]
    pub transcript: String,
    /// Keyed by structured-output (slot) id.
    #[serde(default)]
    pub structured_outputs: BTreeMap<String, StructuredOutput>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredOutput {
    pub name: String,
    #[serde(default)]
    pub result: JsonValue,
}

impl EndOfCallReport {
    /// Provider call id, validated.
    pub fn call_id(&self) -> Result<ProviderCallId, DomainError> {
        ProviderCallId::new(self.message.call.id.clone())
    }

    pub fn is_successful(&self) -> bool {
        let evaluated_true = match &self.message.analysis.success_evaluation {
            JsonValue::Bool(b) => *b,
            JsonValue::String(s) => s.trim().eq_ignore_ascii_case("true"),
            _ => false,
        };
        evaluated_true && self.message.ended_reason == CUSTOMER_ENDED_CALL
    }

    /// Terminal restaurant status this report leads to.
    pub fn final_status(&self) -> EnrichmentStatus {
        if self.is_successful() {
            EnrichmentStatus::Completed
        } else {
            EnrichmentStatus::Failed
        }
    }

    /// Success evaluation as stored text (`"true"`, `"false"`, or the raw value).
    pub fn success_evaluation_text(&self) -> Option<String> {
        match &self.message.analysis.success_evaluation {
            JsonValue::Null => None,
            JsonValue::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Collapse `{slot id → {name, result}}` into the nutrition payload `{name → result}`.
    pub fn nutrition_info(&self) -> JsonValue {
        let collapsed: Map<String, JsonValue> = self
            .message
            .artifact
            .structured_outputs
            .values()
            .map(|output| (output.name.clone(), output.result.clone()))
            .collect();
        JsonValue::Object(collapsed)
    }

    pub fn structured_outputs_json(&self) -> JsonValue {
        serde_json::to_value(&self.message.artifact.structured_outputs).unwrap_or(JsonValue::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn report(success: JsonValue, ended_reason: &str) -> EndOfCallReport {
        serde_json::from_value(json!({
            "message": {
                "call": { "id": "call-1" },
                "endedReason": ended_reason,
                "analysis": { "summary": "friendly chat", "successEvaluation": success },
                "artifact": {
                    "transcript": "AI: hi",
                    "structuredOutputs": {
                        "slot-a": { "name": "cookingOils", "result": "olive oil" },
                        "slot-b": { "name": "nutAllergies", "result": { "nutFree": false } }
                    }
                }
            }
        }))
        .unwrap()
    }

    #[test]
    fn success_requires_truthy_evaluation_and_customer_hangup() {
        assert_eq!(report(json!("true"), CUSTOMER_ENDED_CALL).final_status(), EnrichmentStatus::Completed);
        assert_eq!(report(json!(true), CUSTOMER_ENDED_CALL).final_status(), EnrichmentStatus::Completed);
        assert_eq!(report(json!("false"), CUSTOMER_ENDED_CALL).final_status(), EnrichmentStatus::Failed);
        assert_eq!(report(json!("true"), "silence-timed-out").final_status(), EnrichmentStatus::Failed);
        assert_eq!(report(JsonValue::Null, CUSTOMER_ENDED_CALL).final_status(), EnrichmentStatus::Failed);
    }

    #[test]
    fn structured_outputs_collapse_by_name() {
        let nutrition = report(json!("true"), CUSTOMER_ENDED_CALL).nutrition_info();

        assert_eq!(nutrition["cookingOils"], "olive oil");
        assert_eq!(nutrition["nutAllergies"]["nutFree"], false);
        assert_eq!(nutrition.as_object().unwrap().len(), 2);
    }

    #[test]
    fn blank_call_id_is_rejected() {
        let mut r = report(json!("true"), CUSTOMER_ENDED_CALL);
        r.message.call.id = " ".to_string();
        assert!(r.call_id().is_err());
    }
}
