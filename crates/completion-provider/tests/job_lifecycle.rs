//! Job execution, persistence and replay, driven directly through `CompletionJob`

mod common;

use common::*;
use completion_provider::protocol::{EPILOGUE_OBJECT, ReasonClass};
use completion_provider::logging;
use completion_provider::{CompletionJob, JobError, JobMode, JobStore};
use serde_json::{Value, json};

async fn pending_job(store: &JobStore, job_id: &str, streaming: bool) -> CompletionJob {
    logging::init_test();
    let input = chat_body(streaming);
    let rowid = store
        .insert_pending("peer-1", job_id, &serde_json::to_string(&input).unwrap(), streaming)
        .await
        .unwrap();
    CompletionJob::new(rowid, JobMode::from_streaming(streaming), store.clone())
}

async fn connect_and_read(job: &CompletionJob) -> Vec<u8> {
    let (provider_side, requester_side) = connection();
    let pipe = job.connect(provider_side);
    let bytes = read_all(requester_side).await;
    pipe.await.unwrap().unwrap();
    bytes
}

#[tokio::test]
async fn test_non_streaming_job() {
    let store = JobStore::open_in_memory().unwrap();
    let api = MockCompletionApi::responding(chat_response());
    let rpc = MockMarketplace::default();

    let job = pending_job(&store, "job-1", false).await;
    job.process(&api, "peer-1", "job-1", &offer(), &chat_body(false), &rpc)
        .await
        .unwrap();

    let frames = frames(&connect_and_read(&job).await);
    assert_eq!(frames.len(), 3);
    assert_eq!(frames[0], json!({"status": "Ok"}));
    assert_eq!(frames[1], chat_response());
    assert_eq!(frames[2]["balance_delta"], "200000000000000");
    assert_eq!(frames[2]["completed_at_sync"], FIRST_SYNC);
    assert!(frames[2].get("object").is_none());

    let record = store.get(job.rowid()).await.unwrap().unwrap();
    assert_eq!(record.balance_delta.as_deref(), Some("200000000000000"));
    assert_eq!(record.completed_at_sync, Some(FIRST_SYNC));
    assert!(record.service_error.is_none());
    let stored: Value = serde_json::from_str(record.output.as_deref().unwrap()).unwrap();
    assert_eq!(stored, chat_response());

    let completed = rpc.completed.lock();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].provider_job_id, "job-1");
    assert_eq!(completed[0].balance_delta, "200000000000000");
    assert_eq!(frames[2]["public_payload"], completed[0].public_payload);

    let private: Value = serde_json::from_str(&completed[0].private_payload).unwrap();
    assert_eq!(private["input"]["messages"][0]["content"], "Tell me a secret");
    assert_eq!(private["output"], chat_response());

    assert!(!completed[0].public_payload.contains("secret"));
    let public: Value = serde_json::from_str(&completed[0].public_payload).unwrap();
    assert_eq!(public["response"]["usage"]["prompt_tokens"], 100);
    assert!(rpc.failed.lock().is_empty());
}

#[tokio::test]
async fn test_streaming_job_forwards_chunks_verbatim() {
    let store = JobStore::open_in_memory().unwrap();
    let api = MockCompletionApi::streaming(chat_chunks());
    let rpc = MockMarketplace::default();

    let job = pending_job(&store, "job-1", true).await;
    job.process(&api, "peer-1", "job-1", &offer(), &chat_body(true), &rpc)
        .await
        .unwrap();

    let frames = frames(&connect_and_read(&job).await);
    let chunks = chat_chunks();
    assert_eq!(frames.len(), chunks.len() + 2);
    assert_eq!(frames[0], json!({"status": "Ok"}));
    assert_eq!(&frames[1..=chunks.len()], chunks.as_slice());

    let epilogue = frames.last().unwrap();
    assert_eq!(epilogue["object"], EPILOGUE_OBJECT);
    assert_eq!(epilogue["balance_delta"], "200000000000000");

    let record = store.get(job.rowid()).await.unwrap().unwrap();
    let stored: Vec<Value> = serde_json::from_str(record.output.as_deref().unwrap()).unwrap();
    assert_eq!(stored, chunks);
}

#[tokio::test]
async fn test_connect_while_streaming() {
    let store = JobStore::open_in_memory().unwrap();
    let (api, upstream) = MockCompletionApi::gated();
    let rpc = MockMarketplace::default();
    let job = std::sync::Arc::new(pending_job(&store, "job-1", true).await);

    let (provider_side, early_reader) = connection();
    job.connect(provider_side);

    let runner = {
        let job = job.clone();
        tokio::spawn(async move {
            job.process(&api, "peer-1", "job-1", &offer(), &chat_body(true), &rpc)
                .await
        })
    };

    let chunks = chat_chunks();
    upstream.send(Ok(chunks[0].clone())).await.unwrap();
    tokio::task::yield_now().await;

    let (provider_side, middle_reader) = connection();
    job.connect(provider_side);

    for chunk in &chunks[1..] {
        upstream.send(Ok(chunk.clone())).await.unwrap();
    }
    drop(upstream);
    runner.await.unwrap().unwrap();

    let early = read_all(early_reader).await;
    let middle = read_all(middle_reader).await;
    let late = connect_and_read(&job).await;

    assert_eq!(early, middle);
    assert_eq!(early, late);
    assert_eq!(frames(&early).len(), chunks.len() + 2);
}

#[tokio::test]
async fn test_replay_after_restart_is_byte_identical() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("jobs.sqlite");

    for streaming in [false, true] {
        let job_id = if streaming { "job-stream" } else { "job-plain" };
        let (rowid, first, second) = {
            let store = JobStore::open(&path).unwrap();
            let api = if streaming {
                MockCompletionApi::streaming(chat_chunks_with_logprobs())
            } else {
                MockCompletionApi::responding(chat_response_with_logprobs())
            };
            let rpc = MockMarketplace::default();

            let job = pending_job(&store, job_id, streaming).await;
            job.process(&api, "peer-1", job_id, &offer(), &chat_body(streaming), &rpc)
                .await
                .unwrap();

            let first = connect_and_read(&job).await;
            let second = connect_and_read(&job).await;
            (job.rowid(), first, second)
        };

        let store = JobStore::open(&path).unwrap();
        let rehydrated = CompletionJob::new(rowid, JobMode::from_streaming(streaming), store);
        rehydrated.prefetch().await.unwrap();
        let replayed = connect_and_read(&rehydrated).await;

        assert_eq!(first, second, "streaming = {}", streaming);
        assert_eq!(first, replayed, "streaming = {}", streaming);

        let replayed = frames(&replayed);
        let logprob = &replayed[1]["choices"][0]["logprobs"]["content"][0]["logprob"];
        assert_eq!(logprob.as_f64(), Some(-9.88582262435732696e-3));
    }
}

#[tokio::test]
async fn test_mid_stream_failure() {
    let store = JobStore::open_in_memory().unwrap();
    let api = MockCompletionApi::failing_after(chat_chunks(), 2);
    let rpc = MockMarketplace::default();

    let job = pending_job(&store, "job-1", true).await;
    job.process(&api, "peer-1", "job-1", &offer(), &chat_body(true), &rpc)
        .await
        .unwrap();

    let frames = frames(&connect_and_read(&job).await);
    let chunks = chat_chunks();
    assert_eq!(
        frames,
        vec![json!({"status": "Ok"}), chunks[0].clone(), chunks[1].clone()]
    );

    let record = store.get(job.rowid()).await.unwrap().unwrap();
    assert!(record.service_error.is_some());
    assert!(record.output.is_none());
    assert!(record.balance_delta.is_none());

    assert!(rpc.completed.lock().is_empty());
    let failed = rpc.failed.lock();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].reason_class, ReasonClass::ServiceError);
    let private: Value = serde_json::from_str(failed[0].private_payload.as_deref().unwrap()).unwrap();
    assert_eq!(private["response"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_failure_before_stream() {
    let dir = tempfile::tempdir().unwrap();
    let store = JobStore::open(dir.path().join("jobs.sqlite")).unwrap();
    let api = MockCompletionApi::unavailable();
    let rpc = MockMarketplace::default();

    let job = pending_job(&store, "job-1", false).await;
    job.process(&api, "peer-1", "job-1", &offer(), &chat_body(false), &rpc)
        .await
        .unwrap();

    let live = connect_and_read(&job).await;
    assert_eq!(frames(&live), vec![json!({"status": "ServiceError"})]);

    let record = store.get(job.rowid()).await.unwrap().unwrap();
    assert!(record.service_error.unwrap().contains("503"));
    assert_eq!(rpc.failed.lock()[0].reason, "Service Error");

    let rehydrated = CompletionJob::new(job.rowid(), JobMode::NonStreaming, store.clone());
    rehydrated.prefetch().await.unwrap();
    assert_eq!(connect_and_read(&rehydrated).await, live);
}

#[tokio::test]
async fn test_missing_usage_is_fatal() {
    let store = JobStore::open_in_memory().unwrap();
    let mut chunks = chat_chunks();
    chunks.pop();
    let api = MockCompletionApi::streaming(chunks);
    let rpc = MockMarketplace::default();

    let job = pending_job(&store, "job-1", true).await;
    let result = job
        .process(&api, "peer-1", "job-1", &offer(), &chat_body(true), &rpc)
        .await;
    assert!(matches!(result, Err(JobError::MissingUsage)));

    // Attached sinks still terminate
    assert!(job.buffer().is_closed());
    let frames = frames(&connect_and_read(&job).await);
    assert_eq!(frames.len(), 3);
    assert!(frames.iter().all(|f| f.get("balance_delta").is_none()));

    let record = store.get(job.rowid()).await.unwrap().unwrap();
    assert!(!record.is_terminal());
    assert!(rpc.completed.lock().is_empty());

    let rehydrated = CompletionJob::new(job.rowid(), JobMode::Streaming, store.clone());
    assert!(matches!(
        rehydrated.prefetch().await,
        Err(JobError::NotTerminal(_))
    ));
    assert!(rehydrated.buffer().is_closed());
}

#[tokio::test]
async fn test_prefetch_missing_record() {
    let store = JobStore::open_in_memory().unwrap();
    let job = CompletionJob::new(404, JobMode::NonStreaming, store);
    assert!(matches!(
        job.prefetch().await,
        Err(JobError::RecordMissing(404))
    ));
}


#[tokio::test]
async fn test_restore_outcome_is_shared() {
    let store = JobStore::open_in_memory().unwrap();
    let rowid = pending_job(&store, "job-1", true).await.rowid();

    let live = CompletionJob::new(rowid, JobMode::Streaming, store.clone());
    assert!(live.ready().await.is_ok());
    assert!(!live.buffer().is_closed());

    let restored = CompletionJob::from_storage(rowid, JobMode::Streaming, store);
    let (first, second) = tokio::join!(restored.ready(), restored.ready());
    let first = first.unwrap_err();
    let second = second.unwrap_err();
    assert!(matches!(first.as_ref(), JobError::NotTerminal(id) if *id == rowid));
    assert!(std::sync::Arc::ptr_eq(&first, &second));

    let later = restored.ready().await.unwrap_err();
    assert!(std::sync::Arc::ptr_eq(&first, &later));
    assert!(restored.buffer().is_closed());
    assert!(restored.buffer().is_empty());
}
