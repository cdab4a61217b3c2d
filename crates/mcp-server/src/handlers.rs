use mcp_types::{
    CallToolParams, GetPromptParams, ListPromptsResult, ListResourcesResult, ListToolsResult,
    McpError, ReadResourceParams,
};
use serde::Deserialize;
use serde_json::Value;

use crate::registry::FeatureRegistry;

#[derive(Deserialize, Default)]
struct ListParams {
    cursor: Option<String>,
}

pub async fn list_tools(registry: &FeatureRegistry, params: Option<Value>) -> Result<Value, McpError> {
    let params: ListParams = parse_or_default(params)?;
    let (tools, next_cursor) = registry.list_tools(params.cursor.as_deref());
    to_value(ListToolsResult { tools, next_cursor })
}

pub async fn call_tool(registry: &FeatureRegistry, params: Option<Value>) -> Result<Value, McpError> {
    let params: CallToolParams = parse_required(params)?;
    let entry = registry
        .tool(&params.name)
        .ok_or_else(|| McpError::InvalidParams(format!("Tool {} not found", params.name)))?;
    let result = (entry.handler)(params.arguments)
        .await
        .map_err(|err| McpError::InternalError(err.to_string()))?;
    to_value(result)
}

pub async fn list_prompts(registry: &FeatureRegistry, params: Option<Value>) -> Result<Value, McpError> {
    let params: ListParams = parse_or_default(params)?;
    let (prompts, next_cursor) = registry.list_prompts(params.cursor.as_deref());
    to_value(ListPromptsResult { prompts, next_cursor })
}

pub async fn get_prompt(registry: &FeatureRegistry, params: Option<Value>) -> Result<Value, McpError> {
    let params: GetPromptParams = parse_required(params)?;
    let entry = registry
        .prompt(&params.name)
        .ok_or_else(|| McpError::InvalidParams("Prompt not found".to_string()))?;
    let result = (entry.provider)(params.arguments)
        .await
        .map_err(|err| McpError::InternalError(err.to_string()))?;
    to_value(result)
}

pub async fn list_resources(registry: &FeatureRegistry, params: Option<Value>) -> Result<Value, McpError> {
    let params: ListParams = parse_or_default(params)?;
    let (resources, next_cursor) = registry.list_resources(params.cursor.as_deref());
    to_value(ListResourcesResult { resources, next_cursor })
}

pub async fn read_resource(registry: &FeatureRegistry, params: Option<Value>) -> Result<Value, McpError> {
    let params: ReadResourceParams = parse_required(params)?;
    let entry = registry
        .resource(&params.uri)
        .ok_or_else(|| McpError::InvalidParams("Resource not found".to_string()))?;
    let result = (entry.reader)(params.uri)
        .await
        .map_err(|err| McpError::InternalError(err.to_string()))?;
    to_value(result)
}

pub async fn list_resource_templates(_params: Option<Value>) -> Result<Value, McpError> {
    to_value(serde_json::json!({ "resourceTemplates": [] }))
}

#[derive(Deserialize)]
struct UriParams {
    uri: String,
}

pub async fn subscribe_resource(
    registry: &FeatureRegistry,
    subscriber_id: &str,
    params: Option<Value>,
) -> Result<Value, McpError> {
    let params: UriParams = parse_required(params)?;
    registry.subscribe(&params.uri, subscriber_id);
    to_value(Value::Object(Default::default()))
}

pub async fn unsubscribe_resource(
    registry: &FeatureRegistry,
    subscriber_id: &str,
    params: Option<Value>,
) -> Result<Value, McpError> {
    let params: UriParams = parse_required(params)?;
    registry.unsubscribe(&params.uri, subscriber_id);
    to_value(Value::Object(Default::default()))
}

fn parse_required<T: for<'de> Deserialize<'de>>(params: Option<Value>) -> Result<T, McpError> {
    let params = params.ok_or_else(|| McpError::InvalidParams("missing params".to_string()))?;
    serde_json::from_value(params).map_err(|err| McpError::InvalidParams(err.to_string()))
}

fn parse_or_default<T: for<'de> Deserialize<'de> + Default>(params: Option<Value>) -> Result<T, McpError> {
    match params {
        Some(params) => serde_json::from_value(params).map_err(|err| McpError::InvalidParams(err.to_string())),
        None => Ok(T::default()),
    }
}

fn to_value<T: serde::Serialize>(value: T) -> Result<Value, McpError> {
    serde_json::to_value(value).map_err(|err| McpError::InternalError(err.to_string()))
}
