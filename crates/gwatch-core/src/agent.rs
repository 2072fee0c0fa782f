//! Agent contexts, tasks and contents requested over the gTrace channel.
//!
//! A context owns a DAG of tasks; a task owns the contents (prompts and
//! responses) attached to it. Ids are assigned here:
//! `context-<n>`, `<context>-task-<n>`, `<task>-content-<n>`.

use crate::{Error, Result};
use gwatch_codec::gtrace::AgentUserConfig;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentContent {
    pub global_id: String,
    pub content_typeid: u32,
    pub metadata: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentTask {
    pub global_id: String,
    pub parents: Vec<String>,
    pub children: Vec<String>,
    pub active: bool,
    contents: BTreeMap<String, AgentContent>,
    next_content: u64,
}

impl AgentTask {
    #[must_use]
    pub fn content(&self, global_id: &str) -> Option<&AgentContent> {
        self.contents.get(global_id)
    }

    #[must_use]
    pub fn contents(&self) -> Vec<&AgentContent> {
        self.contents.values().collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentContext {
    pub global_id: String,
    pub user_config: AgentUserConfig,
    pub active: bool,
    tasks: BTreeMap<String, AgentTask>,
    next_task: u64,
}

impl AgentContext {
    #[must_use]
    pub fn task(&self, global_id: &str) -> Option<&AgentTask> {
        self.tasks.get(global_id)
    }

    #[must_use]
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }
}

#[derive(Debug, Default)]
struct Inner {
    contexts: BTreeMap<String, AgentContext>,
    next_context: u64,
}

impl Inner {
    fn active_context(&mut self, context_id: &str) -> Result<&mut AgentContext> {
        match self.contexts.get_mut(context_id) {
            Some(context) if context.active => Ok(context),
            _ => {
                tracing::warn!(context = %context_id, "no active agent context");
                Err(Error::not_exist(format!("agent context {context_id}")))
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct AgentRegistry {
    inner: Mutex<Inner>,
}

impl AgentRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a context and return its id.
    pub fn create_context(&self, user_config: AgentUserConfig) -> String {
        let mut inner = self.inner.lock();
        let global_id = format!("context-{}", inner.next_context);
        inner.next_context += 1;
        inner.contexts.insert(
            global_id.clone(),
            AgentContext {
                global_id: global_id.clone(),
                user_config,
                active: true,
                tasks: BTreeMap::new(),
                next_task: 0,
            },
        );
        tracing::debug!(context = %global_id, "agent context created");
        global_id
    }

    /// Deactivate a context. It stays readable through [`Self::context`].
    pub fn destroy_context(&self, context_id: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.active_context(context_id)?.active = false;
        tracing::debug!(context = %context_id, "agent context destroyed");
        Ok(())
    }

    /// Create a task whose parents must already exist in the same context.
    pub fn create_task(&self, context_id: &str, parents: &[String]) -> Result<String> {
        let mut inner = self.inner.lock();
        let context = inner.active_context(context_id)?;
        if let Some(missing) = parents.iter().find(|p| !context.tasks.contains_key(p.as_str())) {
            tracing::warn!(context = %context_id, parent = %missing, "unknown parent task");
            return Err(Error::not_exist(format!("agent task {missing}")));
        }
        let global_id = format!("{context_id}-task-{}", context.next_task);
        context.next_task += 1;
        for parent in parents {
            if let Some(task) = context.tasks.get_mut(parent) {
                task.children.push(global_id.clone());
            }
        }
        context.tasks.insert(
            global_id.clone(),
            AgentTask {
                global_id: global_id.clone(),
                parents: parents.to_vec(),
                children: Vec::new(),
                active: true,
                contents: BTreeMap::new(),
                next_content: 0,
            },
        );
        Ok(global_id)
    }

    pub fn destroy_task(&self, context_id: &str, task_id: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let context = inner.active_context(context_id)?;
        let task = context
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| Error::not_exist(format!("agent task {task_id}")))?;
        task.active = false;
        Ok(())
    }

    /// Attach a content to an active task. Returns the content id.
    pub fn create_content(
        &self,
        context_id: &str,
        task_id: &str,
        content_typeid: u32,
        body: &str,
        github_bodies: &[String],
    ) -> Result<String> {
        let mut inner = self.inner.lock();
        let context = inner.active_context(context_id)?;
        let task = context
            .tasks
            .get_mut(task_id)
            .filter(|task| task.active)
            .ok_or_else(|| Error::not_exist(format!("agent task {task_id}")))?;
        let global_id = format!("{task_id}-content-{}", task.next_content);
        task.next_content += 1;
        task.contents.insert(
            global_id.clone(),
            AgentContent {
                global_id: global_id.clone(),
                content_typeid,
                metadata: json!({"body": body, "list_github_bodies": github_bodies}),
            },
        );
        Ok(global_id)
    }

    #[must_use]
    pub fn context(&self, context_id: &str) -> Option<AgentContext> {
        self.inner.lock().contexts.get(context_id).cloned()
    }

    #[must_use]
    pub fn active_contexts(&self) -> usize {
        self.inner
            .lock()
            .contexts
            .values()
            .filter(|context| context.active)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gwatch_codec::gtrace::CONTENT_TYPE_PROMPT;

    #[test]
    fn task_parents_must_exist() {
        let registry = AgentRegistry::new();
        let ctx = registry.create_context(AgentUserConfig::default());
        let root = registry.create_task(&ctx, &[]).unwrap();
        assert_eq!(root, "context-0-task-0");
        let child = registry.create_task(&ctx, &[root.clone()]).unwrap();
        let err = registry
            .create_task(&ctx, &["context-0-task-9".to_string()])
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::NotExist);

        let context = registry.context(&ctx).unwrap();
        assert_eq!(context.task(&root).unwrap().children, [child.clone()]);
        assert_eq!(context.task(&child).unwrap().parents, [root]);
        assert_eq!(context.task_count(), 2);
    }

    #[test]
    fn destroyed_context_stays_in_history() {
        let registry = AgentRegistry::new();
        let ctx = registry.create_context(AgentUserConfig::default());
        registry.destroy_context(&ctx).unwrap();
        assert!(registry.destroy_context(&ctx).is_err());
        assert!(registry.create_task(&ctx, &[]).is_err());
        assert!(!registry.context(&ctx).unwrap().active);
        assert_eq!(registry.active_contexts(), 0);
    }

    #[test]
    fn contents_carry_body_metadata() {
        let registry = AgentRegistry::new();
        let ctx = registry.create_context(AgentUserConfig::default());
        let task = registry.create_task(&ctx, &[]).unwrap();
        let content = registry
            .create_content(&ctx, &task, CONTENT_TYPE_PROMPT, "why slow?", &["diff".to_string()])
            .unwrap();
        assert_eq!(content, format!("{task}-content-0"));
        let context = registry.context(&ctx).unwrap();
        let stored = context.task(&task).unwrap().content(&content).unwrap();
        assert_eq!(stored.metadata["body"], "why slow?");
        assert_eq!(stored.metadata["list_github_bodies"][0], "diff");

        registry.destroy_task(&ctx, &task).unwrap();
        assert!(registry.create_content(&ctx, &task, 0, "", &[]).is_err());
    }
}
