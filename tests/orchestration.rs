//! Ingestion and chat-turn behavior with stub collaborators.
//!
//! Real workbooks (built in memory) flow through the real extractor and
//! chunker; embedding and generation are deterministic stubs.

mod common;

use common::{harness, harness_with, sales_workbook, xlsx, Script, ScriptedGenerator};

use sheetqa::config::{CacheKeying, Config};
use sheetqa::error::Error;
use sheetqa::ingest::{ingest_upload, Upload};
use sheetqa::models::Role;
use sheetqa::prompt::UNKNOWN_ANSWER;
use sheetqa::query::{ask, Discard};
use sheetqa::session::Session;

fn upload(name: &str, bytes: Vec<u8>) -> Upload {
    Upload::new(name, bytes)
}

// ============ Ingestion ============

#[tokio::test]
async fn second_upload_of_same_name_reuses_pipeline() {
    let h = harness();
    let mut session = Session::new();

    let first = ingest_upload(&mut session, upload("sales.xlsx", sales_workbook()), &h.services)
        .await
        .unwrap();
    assert!(!first.cached);
    assert!(first.chunks >= 1);
    let embed_calls = h.embedder.calls();

    let second = ingest_upload(&mut session, upload("sales.xlsx", sales_workbook()), &h.services)
        .await
        .unwrap();
    assert!(second.cached);
    assert_eq!(second.chunks, 0);
    assert!(first.handle.ptr_eq(&second.handle));
    assert_eq!(h.extractor.calls(), 1);
    assert_eq!(h.embedder.calls(), embed_calls);
    assert_eq!(session.pipeline_count(), 1);
}

#[tokio::test]
async fn caches_are_isolated_between_sessions() {
    let h = harness();
    let mut a = Session::new();
    let mut b = Session::new();

    let in_a = ingest_upload(&mut a, upload("sales.xlsx", sales_workbook()), &h.services)
        .await
        .unwrap();
    assert!(b
        .lookup_pipeline(&b.cache_key("sales.xlsx", None))
        .is_none());

    let in_b = ingest_upload(&mut b, upload("sales.xlsx", sales_workbook()), &h.services)
        .await
        .unwrap();
    assert!(!in_b.cached);
    assert!(!in_a.handle.ptr_eq(&in_b.handle));
    assert_eq!(h.extractor.calls(), 2);
}

#[tokio::test]
async fn unsupported_type_rejected_before_extraction() {
    let h = harness();
    let mut session = Session::new();

    let err = ingest_upload(&mut session, upload("notes.csv", b"a,b\n1,2\n".to_vec()), &h.services)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnsupportedFileType(ref name) if name == "notes.csv"));
    assert_eq!(err.code(), "unsupported_file_type");
    assert_eq!(h.extractor.calls(), 0);
    assert_eq!(session.pipeline_count(), 0);
    assert!(session.active_document().is_none());
}

#[tokio::test]
async fn extension_check_ignores_case() {
    let h = harness();
    let mut session = Session::new();
    let outcome = ingest_upload(&mut session, upload("SALES.XLSX", sales_workbook()), &h.services)
        .await
        .unwrap();
    assert!(!outcome.cached);
    assert_eq!(session.active_document(), Some("SALES.XLSX"));
}

#[tokio::test]
async fn unreadable_workbook_leaves_no_cache_entry() {
    let h = harness();
    let mut session = Session::new();

    let err = ingest_upload(&mut session, upload("broken.xlsx", b"not a zip".to_vec()), &h.services)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Extraction { .. }));
    assert_eq!(session.pipeline_count(), 0);
    assert!(session.active_document().is_none());

    // The scoped temp file is gone even though ingestion failed.
    let seen = h.extractor.last_path().unwrap();
    assert!(!seen.exists());
}

#[tokio::test]
async fn temp_file_removed_after_success() {
    let h = harness();
    let mut session = Session::new();
    ingest_upload(&mut session, upload("sales.xlsx", sales_workbook()), &h.services)
        .await
        .unwrap();
    let seen = h.extractor.last_path().unwrap();
    assert!(seen.ends_with("sales.xlsx"));
    assert!(!seen.exists());
    assert!(!seen.parent().unwrap().exists());
}

#[tokio::test]
async fn failed_ingest_can_be_retried() {
    let h = harness();
    let mut session = Session::new();
    assert!(ingest_upload(&mut session, upload("book.xlsx", b"junk".to_vec()), &h.services)
        .await
        .is_err());

    let outcome = ingest_upload(&mut session, upload("book.xlsx", sales_workbook()), &h.services)
        .await
        .unwrap();
    assert!(!outcome.cached);
    assert_eq!(session.pipeline_count(), 1);
}

#[tokio::test]
async fn name_keying_serves_stale_pipeline_for_changed_content() {
    let h = harness();
    let mut session = Session::new();
    ingest_upload(&mut session, upload("sales.xlsx", sales_workbook()), &h.services)
        .await
        .unwrap();

    let changed = xlsx(&[("Q4", &[&["Region", "Revenue"], &["West", "5"]])]);
    let outcome = ingest_upload(&mut session, upload("sales.xlsx", changed), &h.services)
        .await
        .unwrap();
    assert!(outcome.cached);
    assert_eq!(h.extractor.calls(), 1);
    // The preview always reflects the bytes just uploaded.
    assert_eq!(outcome.preview.sheet_name, "Q4");
}

#[tokio::test]
async fn content_keying_reindexes_changed_content() {
    let mut config = Config::minimal();
    config.cache.key = CacheKeying::Content;
    let h = harness_with(config, ScriptedGenerator::new(&["ok"]));
    let mut session = Session::new();

    ingest_upload(&mut session, upload("sales.xlsx", sales_workbook()), &h.services)
        .await
        .unwrap();
    let same = ingest_upload(&mut session, upload("sales.xlsx", sales_workbook()), &h.services)
        .await
        .unwrap();
    assert!(same.cached);

    let changed = xlsx(&[("Q4", &[&["Region", "Revenue"], &["West", "5"]])]);
    let fresh = ingest_upload(&mut session, upload("sales.xlsx", changed), &h.services)
        .await
        .unwrap();
    assert!(!fresh.cached);
    assert_eq!(h.extractor.calls(), 2);
    assert_eq!(session.pipeline_count(), 2);
}

#[tokio::test]
async fn upload_returns_preview_of_first_sheet() {
    let h = harness();
    let mut session = Session::new();
    let outcome = ingest_upload(&mut session, upload("sales.xlsx", sales_workbook()), &h.services)
        .await
        .unwrap();
    assert_eq!(outcome.preview.sheet_name, "Q3");
    assert_eq!(outcome.preview.columns, vec!["Region", "Revenue", "Units"]);
    assert_eq!(outcome.preview.total_rows, 3);
    assert_eq!(outcome.preview.rows[0], vec!["North", "1200", "40"]);
}

#[tokio::test]
async fn latest_upload_becomes_active() {
    let h = harness();
    let mut session = Session::new();
    ingest_upload(&mut session, upload("a.xlsx", sales_workbook()), &h.services)
        .await
        .unwrap();
    ingest_upload(&mut session, upload("b.xlsx", sales_workbook()), &h.services)
        .await
        .unwrap();
    assert_eq!(session.active_document(), Some("b.xlsx"));

    // Re-selecting a cached document switches back without re-indexing.
    ingest_upload(&mut session, upload("a.xlsx", sales_workbook()), &h.services)
        .await
        .unwrap();
    assert_eq!(session.active_document(), Some("a.xlsx"));
    assert_eq!(h.extractor.calls(), 2);
}

// ============ Chat turns ============

#[tokio::test]
async fn streamed_fragments_accumulate_into_one_message() {
    let h = harness_with(
        Config::minimal(),
        ScriptedGenerator::new(&["The ", "answer ", "is 42."]),
    );
    let mut session = Session::new();
    ingest_upload(&mut session, upload("sales.xlsx", sales_workbook()), &h.services)
        .await
        .unwrap();

    let mut partials: Vec<String> = Vec::new();
    let mut sink = |_fragment: &str, partial: &str| partials.push(partial.to_string());
    let answer = ask(&mut session, "What is the answer?", &mut sink).await.unwrap();

    assert_eq!(answer.text, "The answer is 42.");
    assert_eq!(partials, vec!["The ", "The answer ", "The answer is 42."]);
    for pair in partials.windows(2) {
        assert!(pair[1].starts_with(&pair[0]));
    }

    let transcript = session.transcript();
    assert_eq!(transcript.len(), 2);
    assert_eq!(transcript[0].role, Role::User);
    assert_eq!(transcript[0].content, "What is the answer?");
    assert_eq!(transcript[1].role, Role::Assistant);
    assert_eq!(transcript[1].content, "The answer is 42.");
}

#[tokio::test]
async fn unknown_answer_is_recorded_verbatim() {
    let h = harness_with(Config::minimal(), ScriptedGenerator::new(&[UNKNOWN_ANSWER]));
    let mut session = Session::new();
    ingest_upload(&mut session, upload("sales.xlsx", sales_workbook()), &h.services)
        .await
        .unwrap();

    ask(&mut session, "Who won the 1998 World Cup?", &mut Discard)
        .await
        .unwrap();
    assert_eq!(session.transcript().last().unwrap().content, "I don't know!");
}

#[tokio::test]
async fn prompt_carries_retrieved_rows_and_question() {
    let h = harness();
    let mut session = Session::new();
    ingest_upload(&mut session, upload("sales.xlsx", sales_workbook()), &h.services)
        .await
        .unwrap();

    let answer = ask(&mut session, "What was North revenue?", &mut Discard)
        .await
        .unwrap();
    assert!(!answer.sources.is_empty());
    assert!(answer.sources.len() <= 2);

    let prompts = h.generator.prompts();
    assert_eq!(prompts.len(), 1);
    assert!(prompts[0].starts_with("Context information is below."));
    assert!(prompts[0].contains("| North | 1200 | 40 |"));
    assert!(prompts[0].contains("Query: What was North revenue?\nAnswer: "));
    assert_eq!(session.context().unwrap().len(), answer.sources.len());
}

#[tokio::test]
async fn mid_stream_failure_leaves_no_assistant_message() {
    let h = harness_with(Config::minimal(), ScriptedGenerator::new(&["Recovered."]));
    h.generator.push(Script::broken(&["Partial "], "connection reset"));
    let mut session = Session::new();
    ingest_upload(&mut session, upload("sales.xlsx", sales_workbook()), &h.services)
        .await
        .unwrap();

    let err = ask(&mut session, "First question?", &mut Discard)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Generation(ref msg) if msg.contains("connection reset")));
    assert_eq!(session.transcript().len(), 1);
    assert_eq!(session.transcript()[0].role, Role::User);

    let answer = ask(&mut session, "Second question?", &mut Discard)
        .await
        .unwrap();
    assert_eq!(answer.text, "Recovered.");
    let roles: Vec<Role> = session.transcript().iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![Role::User, Role::User, Role::Assistant]);
}

#[tokio::test]
async fn generator_that_never_starts_is_a_generation_error() {
    let h = harness_with(Config::minimal(), ScriptedGenerator::unreachable());
    let mut session = Session::new();
    ingest_upload(&mut session, upload("sales.xlsx", sales_workbook()), &h.services)
        .await
        .unwrap();

    let err = ask(&mut session, "Anything?", &mut Discard).await.unwrap_err();
    assert_eq!(err.code(), "generation_error");
    assert!(session
        .transcript()
        .iter()
        .all(|m| m.role != Role::Assistant));
}

#[tokio::test]
async fn question_before_upload_is_rejected() {
    let mut session = Session::new();
    let err = ask(&mut session, "Hello?", &mut Discard).await.unwrap_err();
    assert!(matches!(err, Error::NoActiveDocument));
    assert!(session.transcript().is_empty());
}

// ============ Reset ============

#[tokio::test]
async fn reset_clears_chat_but_keeps_pipeline() {
    let h = harness();
    let mut session = Session::new();
    ingest_upload(&mut session, upload("sales.xlsx", sales_workbook()), &h.services)
        .await
        .unwrap();
    ask(&mut session, "What was North revenue?", &mut Discard)
        .await
        .unwrap();
    assert_eq!(session.transcript().len(), 2);
    assert!(session.context().is_some());

    session.reset();

    assert!(session.transcript().is_empty());
    assert!(session.context().is_none());
    assert!(session
        .lookup_pipeline(&session.cache_key("sales.xlsx", None))
        .is_some());

    // Chat continues against the cached pipeline without re-indexing.
    ask(&mut session, "And South?", &mut Discard).await.unwrap();
    assert_eq!(session.transcript().len(), 2);
    assert_eq!(h.extractor.calls(), 1);
}

#[tokio::test]
async fn every_sheet_is_indexed() {
    let h = harness();
    let mut session = Session::new();
    let book = xlsx(&[
        ("Revenue", &[&["Region", "Revenue"], &["North", "1200"]]),
        ("Staff", &[&["Team", "Headcount"], &["Platform", "12"]]),
    ]);
    let outcome = ingest_upload(&mut session, upload("multi.xlsx", book), &h.services)
        .await
        .unwrap();
    assert_eq!(outcome.chunks, 2);
    assert_eq!(outcome.preview.sheet_count, 2);

    ask(&mut session, "What is the Platform team Headcount?", &mut Discard)
        .await
        .unwrap();
    let prompt = h.generator.prompts().pop().unwrap();
    assert!(prompt.contains("# Sheet: Staff"));
}
