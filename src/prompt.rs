//! The fixed question-answering prompt.
//!
//! Every query against every document uses the same template; there is
//! no per-call customization.

use crate::models::RetrievedChunk;

pub const QA_TEMPLATE: &str = "Context information is below.\n\
---------------------\n\
{context_str}\n\
---------------------\n\
Given the context information above I want you to think step by step to answer the query in a highly precise and crisp manner focused on the final answer, incase case you don't know the answer say 'I don't know!'.\n\
Query: {query_str}\n\
Answer: ";

/// Answer the template instructs the model to give when the context is insufficient.
pub const UNKNOWN_ANSWER: &str = "I don't know!";

/// Join retrieved chunks into the `{context_str}` block.
pub fn context_block(chunks: &[RetrievedChunk]) -> String {
    chunks
        .iter()
        .map(|c| c.text.trim())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Fill both placeholders in one pass so neither value is re-scanned.
pub fn render_qa_prompt(chunks: &[RetrievedChunk], query: &str) -> String {
    let (head, rest) = QA_TEMPLATE
        .split_once("{context_str}")
        .unwrap_or((QA_TEMPLATE, ""));
    let (middle, tail) = rest.split_once("{query_str}").unwrap_or((rest, ""));
    format!("{}{}{}{}{}", head, context_block(chunks), middle, query, tail)
}
