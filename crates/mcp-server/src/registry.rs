use std::sync::RwLock as StdRwLock;
use std::sync::Arc;

use dashmap::DashMap;
use mcp_protocol::BoxFuture;
use mcp_types::{CallToolResult, GetPromptResult, McpError, Prompt, ReadResourceResult, Resource, Tool};
use serde_json::Value;

pub type ToolHandlerFn = Arc<dyn Fn(Value) -> BoxFuture<Result<CallToolResult, McpError>> + Send + Sync>;
pub type PromptProviderFn =
    Arc<dyn Fn(Option<Value>) -> BoxFuture<Result<GetPromptResult, McpError>> + Send + Sync>;
pub type ResourceReaderFn =
    Arc<dyn Fn(String) -> BoxFuture<Result<ReadResourceResult, McpError>> + Send + Sync>;

#[derive(Clone)]
pub struct RegisteredTool {
    pub tool: Tool,
    pub handler: ToolHandlerFn,
}

#[derive(Clone)]
pub struct RegisteredPrompt {
    pub prompt: Prompt,
    pub provider: PromptProviderFn,
}

#[derive(Clone)]
pub struct RegisteredResource {
    pub resource: Resource,
    pub reader: ResourceReaderFn,
}

/// Default page size for cursor-based `*/list` pagination. The cursor
/// itself is the decimal offset of the next page's first entry; it is
/// opaque to callers, who must treat it as an inert token.
const PAGE_SIZE: usize = 50;

/// Thread-safe, mutation-notifying catalogue of tools, prompts, and
/// resources (C9). Entries are keyed by name (tools, prompts) or uri
/// (resources) in sharded concurrent maps, matching the dependency choice
/// spec §9 explicitly allows in place of copy-on-write snapshots.
///
/// This type only holds state; it does not know how to dispatch
/// notifications to peers. [`crate::server::Server`] drives list-changed
/// and resource-updated notifications after each mutation succeeds.
#[derive(Default)]
pub struct FeatureRegistry {
    tools: DashMap<String, RegisteredTool>,
    prompts: DashMap<String, RegisteredPrompt>,
    resources: DashMap<String, RegisteredResource>,
    /// uri -> set of subscriber ids, using `()` as a degenerate set value
    /// since membership, not payload, is all that matters.
    subscriptions: DashMap<String, DashMap<String, ()>>,
    /// Held for the duration of a batch `add_*` so a concurrent `list_*`
    /// either sees every entry of the batch or none of it; single-entry
    /// `add_tool`/`add_prompt`/`add_resource` calls don't need it, since one
    /// `DashMap::insert` is already atomic on its own.
    tools_batch: StdRwLock<()>,
    prompts_batch: StdRwLock<()>,
    resources_batch: StdRwLock<()>,
}

impl FeatureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_tool(&self, tool: Tool, handler: ToolHandlerFn) {
        self.tools.insert(tool.name.clone(), RegisteredTool { tool, handler });
    }

    pub fn add_tools(&self, entries: Vec<(Tool, ToolHandlerFn)>) {
        let _guard = self.tools_batch.write().expect("tools batch lock poisoned");
        for (tool, handler) in entries {
            self.tools.insert(tool.name.clone(), RegisteredTool { tool, handler });
        }
    }

    pub fn remove_tool(&self, name: &str) -> Option<RegisteredTool> {
        self.tools.remove(name).map(|(_, entry)| entry)
    }

    pub fn tool(&self, name: &str) -> Option<RegisteredTool> {
        self.tools.get(name).map(|entry| entry.clone())
    }

    pub fn list_tools(&self, cursor: Option<&str>) -> (Vec<Tool>, Option<String>) {
        let _guard = self.tools_batch.read().expect("tools batch lock poisoned");
        let mut names: Vec<String> = self.tools.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        paginate(&names, cursor, |name| {
            self.tools.get(name).map(|entry| entry.tool.clone())
        })
    }

    pub fn add_prompt(&self, prompt: Prompt, provider: PromptProviderFn) {
        self.prompts.insert(prompt.name.clone(), RegisteredPrompt { prompt, provider });
    }

    pub fn add_prompts(&self, entries: Vec<(Prompt, PromptProviderFn)>) {
        let _guard = self.prompts_batch.write().expect("prompts batch lock poisoned");
        for (prompt, provider) in entries {
            self.prompts.insert(prompt.name.clone(), RegisteredPrompt { prompt, provider });
        }
    }

    pub fn remove_prompt(&self, name: &str) -> Option<RegisteredPrompt> {
        self.prompts.remove(name).map(|(_, entry)| entry)
    }

    pub fn prompt(&self, name: &str) -> Option<RegisteredPrompt> {
        self.prompts.get(name).map(|entry| entry.clone())
    }

    pub fn list_prompts(&self, cursor: Option<&str>) -> (Vec<Prompt>, Option<String>) {
        let _guard = self.prompts_batch.read().expect("prompts batch lock poisoned");
        let mut names: Vec<String> = self.prompts.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        paginate(&names, cursor, |name| {
            self.prompts.get(name).map(|entry| entry.prompt.clone())
        })
    }

    pub fn add_resource(&self, resource: Resource, reader: ResourceReaderFn) {
        self.resources
            .insert(resource.uri.clone(), RegisteredResource { resource, reader });
    }

    pub fn add_resources(&self, entries: Vec<(Resource, ResourceReaderFn)>) {
        let _guard = self.resources_batch.write().expect("resources batch lock poisoned");
        for (resource, reader) in entries {
            self.resources
                .insert(resource.uri.clone(), RegisteredResource { resource, reader });
        }
    }

    /// Removes a resource, returning it along with the uri's subscribers so
    /// the caller can emit exactly one `resources/updated` per subscriber.
    pub fn remove_resource(&self, uri: &str) -> Option<(RegisteredResource, Vec<String>)> {
        let entry = self.resources.remove(uri).map(|(_, entry)| entry)?;
        let subscribers = self
            .subscriptions
            .remove(uri)
            .map(|(_, subs)| subs.iter().map(|s| s.key().clone()).collect())
            .unwrap_or_default();
        Some((entry, subscribers))
    }

    pub fn resource(&self, uri: &str) -> Option<RegisteredResource> {
        self.resources.get(uri).map(|entry| entry.clone())
    }

    pub fn list_resources(&self, cursor: Option<&str>) -> (Vec<Resource>, Option<String>) {
        let _guard = self.resources_batch.read().expect("resources batch lock poisoned");
        let mut uris: Vec<String> = self.resources.iter().map(|entry| entry.key().clone()).collect();
        uris.sort();
        paginate(&uris, cursor, |uri| {
            self.resources.get(uri).map(|entry| entry.resource.clone())
        })
    }

    pub fn subscribe(&self, uri: &str, subscriber_id: &str) {
        self.subscriptions
            .entry(uri.to_string())
            .or_default()
            .insert(subscriber_id.to_string(), ());
    }

    pub fn unsubscribe(&self, uri: &str, subscriber_id: &str) {
        if let Some(subs) = self.subscriptions.get(uri) {
            subs.remove(subscriber_id);
        }
    }

    pub fn tool_count(&self) -> usize {
        let _guard = self.tools_batch.read().expect("tools batch lock poisoned");
        self.tools.len()
    }

    pub fn prompt_count(&self) -> usize {
        let _guard = self.prompts_batch.read().expect("prompts batch lock poisoned");
        self.prompts.len()
    }

    pub fn resource_count(&self) -> usize {
        let _guard = self.resources_batch.read().expect("resources batch lock poisoned");
        self.resources.len()
    }
}

fn paginate<T>(
    sorted_keys: &[String],
    cursor: Option<&str>,
    fetch: impl Fn(&str) -> Option<T>,
) -> (Vec<T>, Option<String>) {
    let start = match cursor {
        Some(token) => token.parse::<usize>().unwrap_or(0),
        None => 0,
    };
    let end = (start + PAGE_SIZE).min(sorted_keys.len());
    let page: Vec<T> = sorted_keys[start..end].iter().filter_map(|key| fetch(key)).collect();
    let next_cursor = if end < sorted_keys.len() {
        Some(end.to_string())
    } else {
        None
    };
    (page, next_cursor)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_handler() -> ToolHandlerFn {
        Arc::new(|_args| {
            Box::pin(async { Ok(CallToolResult { content: vec![], is_error: None }) })
                as BoxFuture<Result<CallToolResult, McpError>>
        })
    }

    #[test]
    fn add_and_list_tool() {
        let registry = FeatureRegistry::new();
        registry.add_tool(
            Tool {
                name: "greet".to_string(),
                description: "d".to_string(),
                input_schema: serde_json::json!({"type": "object"}),
                output_schema: None,
                annotations: None,
            },
            noop_handler(),
        );
        let (tools, cursor) = registry.list_tools(None);
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "greet");
        assert!(cursor.is_none());
    }

    #[test]
    fn pagination_splits_into_pages() {
        let registry = FeatureRegistry::new();
        for i in 0..(PAGE_SIZE + 5) {
            registry.add_tool(
                Tool {
                    name: format!("tool-{i:03}"),
                    description: "d".to_string(),
                    input_schema: serde_json::json!({}),
                    output_schema: None,
                    annotations: None,
                },
                noop_handler(),
            );
        }
        let (first_page, cursor) = registry.list_tools(None);
        assert_eq!(first_page.len(), PAGE_SIZE);
        let cursor = cursor.expect("more pages remain");
        let (second_page, next_cursor) = registry.list_tools(Some(&cursor));
        assert_eq!(second_page.len(), 5);
        assert!(next_cursor.is_none());
    }

    #[test]
    fn concurrent_reader_never_observes_a_partial_add_tools_batch() {
        const BATCH: usize = 40;
        let registry = Arc::new(FeatureRegistry::new());

        let writer_registry = registry.clone();
        let writer = std::thread::spawn(move || {
            for round in 0..20 {
                let entries = (0..BATCH)
                    .map(|i| {
                        (
                            Tool {
                                name: format!("round-{round}-tool-{i}"),
                                description: "d".to_string(),
                                input_schema: serde_json::json!({}),
                                output_schema: None,
                                annotations: None,
                            },
                            noop_handler(),
                        )
                    })
                    .collect();
                writer_registry.add_tools(entries);
            }
        });

        let reader_registry = registry.clone();
        let reader = std::thread::spawn(move || {
            for _ in 0..2000 {
                let count = reader_registry.tool_count();
                assert_eq!(count % BATCH, 0, "observed a partial batch: {count} tools");
            }
        });

        writer.join().unwrap();
        reader.join().unwrap();
        assert_eq!(registry.tool_count(), BATCH * 20);
    }

    #[test]
    fn removing_resource_reports_its_subscribers() {
        let registry = FeatureRegistry::new();
        registry.add_resource(
            Resource {
                uri: "file:///x".to_string(),
                name: "x".to_string(),
                description: "d".to_string(),
                mime_type: "text/plain".to_string(),
            },
            Arc::new(|_uri| {
                Box::pin(async { Ok(ReadResourceResult { contents: vec![] }) })
                    as BoxFuture<Result<ReadResourceResult, McpError>>
            }),
        );
        registry.subscribe("file:///x", "client-a");
        registry.subscribe("file:///x", "client-b");

        let (_, mut subscribers) = registry.remove_resource("file:///x").expect("resource existed");
        subscribers.sort();
        assert_eq!(subscribers, vec!["client-a".to_string(), "client-b".to_string()]);
        assert!(registry.remove_resource("file:///x").is_none());
    }
}
