//! Prompt assembly and bounded conversation memory
//!
//! Memory holds user/assistant pairs up to `max_context_turns`; when the
//! bound is exceeded the oldest pair is dropped. Context flags from the
//! fuser are appended to the system prompt so the engine can adapt tone.

use std::collections::VecDeque;

use callweave_core::traits::MemoryMessage;
use callweave_core::{ContextFlags, DialogueRequest, TurnRole};
use serde_json::Value;

/// Rolling user/assistant memory bounded in pairs
#[derive(Debug, Clone)]
pub struct ConversationMemory {
    messages: VecDeque<MemoryMessage>,
    max_pairs: usize,
}

impl ConversationMemory {
    pub fn new(max_pairs: usize) -> Self {
        Self {
            messages: VecDeque::new(),
            max_pairs,
        }
    }

    pub fn push(&mut self, role: TurnRole, content: impl Into<String>) {
        let role = match role {
            TurnRole::User => "user",
            TurnRole::Assistant => "assistant",
        };
        self.messages.push_back(MemoryMessage {
            role: role.to_string(),
            content: content.into(),
        });

        // Drop the oldest user/assistant pair once over the bound
        while self.messages.len() > self.max_pairs * 2 {
            self.messages.pop_front();
            self.messages.pop_front();
        }
    }

    pub fn messages(&self) -> Vec<MemoryMessage> {
        self.messages.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }
}

/// Assembles the dialogue request from profile, flags, and memory
pub struct PromptAssembler {
    /// Base system prompt from the agent's context profile
    context_profile: String,
}

impl PromptAssembler {
    pub fn new(context_profile: impl Into<String>) -> Self {
        Self {
            context_profile: context_profile.into(),
        }
    }

    /// Build the full request for one user utterance
    pub fn assemble(
        &self,
        conversation_id: &str,
        memory: &ConversationMemory,
        user_text: &str,
        flags: &ContextFlags,
        tools: Vec<Value>,
    ) -> DialogueRequest {
        let notes = context_notes(flags);
        let mut system = self.context_profile.clone();
        if !notes.is_empty() {
            system.push_str("\n\nConversation signals:\n");
            for note in notes {
                system.push_str("- ");
                system.push_str(&note);
                system.push('\n');
            }
        }

        DialogueRequest {
            conversation_id: conversation_id.to_string(),
            system,
            memory: memory.messages(),
            user: user_text.to_string(),
            tools,
        }
    }
}

/// Human-readable directives for the system prompt, one per raised flag
fn context_notes(flags: &ContextFlags) -> Vec<String> {
    let mut notes = Vec::new();
    if flags.repeated_question {
        notes.push(
            "The caller is repeating a question they already asked; answer differently and more concretely."
                .to_string(),
        );
    }
    if flags.user_frustrated {
        notes.push("The caller sounds frustrated; acknowledge it and keep answers short.".to_string());
    }
    if flags.escalation_request {
        notes.push("The caller asked for a human agent; offer a transfer.".to_string());
    }
    if flags.confused {
        notes.push("The caller seems confused; explain step by step.".to_string());
    }
    notes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_bounded_in_pairs() {
        let mut memory = ConversationMemory::new(2);
        for i in 0..5 {
            memory.push(TurnRole::User, format!("u{}", i));
            memory.push(TurnRole::Assistant, format!("a{}", i));
        }
        // 2 pairs max
        assert_eq!(memory.len(), 4);
        let msgs = memory.messages();
        assert_eq!(msgs[0].content, "u3");
        assert_eq!(msgs[3].content, "a4");
    }

    #[test]
    fn test_assemble_includes_notes() {
        let assembler = PromptAssembler::new("You are a call-center assistant.");
        let memory = ConversationMemory::new(10);
        let request = assembler.assemble(
            "c1",
            &memory,
            "hola",
            &ContextFlags {
                user_frustrated: true,
                ..Default::default()
            },
            vec![],
        );

        assert!(request.system.starts_with("You are a call-center assistant."));
        assert!(request.system.contains("frustrated"));
        assert_eq!(request.user, "hola");
    }

    #[test]
    fn test_no_flags_leaves_system_untouched() {
        let assembler = PromptAssembler::new("Base.");
        let memory = ConversationMemory::new(10);
        let request =
            assembler.assemble("c1", &memory, "hola", &ContextFlags::default(), vec![]);
        assert_eq!(request.system, "Base.");
    }
}
