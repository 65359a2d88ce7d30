//! Per-invocation progress bus.
//!
//! Observers register before the graph runs. Each gets a bounded queue
//! drained by its own worker task, so fanout is concurrent across observers
//! while every observer sees events in emit order. Non-critical stage ticks
//! may be dropped under pressure and streamed chunks may be coalesced; the
//! final chunk, stream completion, completion and error always arrive.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use murmur_provider::RoleGateway;
use murmur_schema::{CancelToken, CoreError, ProgressEvent, ProgressStage, Source, StreamingChunk};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

const BLURB_MAX_CHARS: usize = 16;

#[async_trait]
pub trait ProgressObserver: Send + Sync {
    async fn on_progress(&self, event: ProgressEvent);
    async fn on_streaming_chunk(&self, chunk: StreamingChunk);
    async fn on_streaming_complete(&self);
    async fn on_completion(&self, final_text: String, sources: Vec<Source>);
    async fn on_error(&self, error: CoreError);
}

#[derive(Debug, Clone)]
pub struct ObserverSettings {
    /// Minimum interval between streamed deliveries to this observer.
    pub min_chunk_interval: Duration,
    /// Hard ceiling on accumulated chunk text before a forced flush.
    pub max_chunk_buffer: usize,
    pub queue_capacity: usize,
}

impl Default for ObserverSettings {
    fn default() -> Self {
        Self {
            min_chunk_interval: Duration::from_millis(500),
            max_chunk_buffer: 1500,
            queue_capacity: 64,
        }
    }
}

#[derive(Debug)]
enum BusItem {
    Event(ProgressEvent),
    Chunk(StreamingChunk),
    StreamComplete,
    Completion(String, Vec<Source>),
    Error(CoreError),
    Close,
}

impl BusItem {
    fn droppable(&self) -> bool {
        match self {
            BusItem::Event(event) => !event.stage.is_terminal(),
            BusItem::Chunk(chunk) => !chunk.is_final,
            _ => false,
        }
    }
}

struct SubscriberQueue {
    items: Mutex<VecDeque<BusItem>>,
    notify: Notify,
    capacity: usize,
}

impl SubscriberQueue {
    fn push(&self, item: BusItem) {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        if items.len() >= self.capacity {
            // Drop the oldest non-critical entry; failing that, drop the
            // incoming item if it is itself non-critical.
            if let Some(idx) = items.iter().position(|i| i.droppable()) {
                items.remove(idx);
            } else if item.droppable() {
                return;
            }
        }
        items.push_back(item);
        drop(items);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<BusItem> {
        self.items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }
}

/// Merges streamed chunks per observer.
struct ChunkBuffer {
    pending: String,
    last_flush: Instant,
    min_interval: Duration,
    max_buffer: usize,
}

impl ChunkBuffer {
    fn new(settings: &ObserverSettings) -> Self {
        Self {
            pending: String::new(),
            last_flush: Instant::now(),
            min_interval: settings.min_chunk_interval,
            max_buffer: settings.max_chunk_buffer,
        }
    }

    fn push(&mut self, chunk: StreamingChunk) -> Option<StreamingChunk> {
        self.pending.push_str(&chunk.content);
        if chunk.is_final {
            self.last_flush = Instant::now();
            return Some(StreamingChunk {
                content: std::mem::take(&mut self.pending),
                is_final: true,
            });
        }
        if self.pending.len() >= self.max_buffer
            || self.last_flush.elapsed() >= self.min_interval
        {
            if self.pending.is_empty() {
                return None;
            }
            self.last_flush = Instant::now();
            return Some(StreamingChunk {
                content: std::mem::take(&mut self.pending),
                is_final: false,
            });
        }
        None
    }

    fn drain(&mut self) -> Option<StreamingChunk> {
        if self.pending.is_empty() {
            return None;
        }
        self.last_flush = Instant::now();
        Some(StreamingChunk {
            content: std::mem::take(&mut self.pending),
            is_final: false,
        })
    }
}

struct SubscriberHandle {
    queue: Arc<SubscriberQueue>,
    worker: JoinHandle<()>,
}

pub struct ProgressBus {
    subscribers: Vec<SubscriberHandle>,
    terminal_fired: AtomicBool,
    auto_generate: bool,
    gateway: Option<Arc<RoleGateway>>,
    templates: HashMap<String, String>,
    context: Mutex<String>,
}

impl ProgressBus {
    pub fn new(
        auto_generate: bool,
        gateway: Option<Arc<RoleGateway>>,
        template_overrides: HashMap<String, String>,
    ) -> Self {
        Self {
            subscribers: Vec::new(),
            terminal_fired: AtomicBool::new(false),
            auto_generate,
            gateway,
            templates: template_overrides,
            context: Mutex::new(String::new()),
        }
    }

    /// Bus with no blurb generation; stage templates only.
    pub fn plain() -> Self {
        Self::new(false, None, HashMap::new())
    }

    pub fn register(&mut self, observer: Arc<dyn ProgressObserver>, settings: ObserverSettings) {
        let queue = Arc::new(SubscriberQueue {
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity: settings.queue_capacity.max(8),
        });
        let worker_queue = Arc::clone(&queue);
        let worker = tokio::spawn(async move {
            drain_queue(observer, settings, worker_queue).await;
        });
        self.subscribers.push(SubscriberHandle { queue, worker });
    }

    pub fn has_observers(&self) -> bool {
        !self.subscribers.is_empty()
    }

    /// Recent conversation text fed to auto-generated blurbs.
    pub fn set_context(&self, context: impl Into<String>) {
        *self.context.lock().unwrap_or_else(|e| e.into_inner()) = context.into();
    }

    pub async fn emit_stage(&self, stage: ProgressStage, pct: Option<u8>) {
        let mut event = ProgressEvent::stage(stage);
        event.progress_pct = pct.map(|p| p.min(100));
        self.emit(event).await;
    }

    pub async fn emit(&self, mut event: ProgressEvent) {
        if self.subscribers.is_empty() {
            return;
        }
        if event.message.is_empty() {
            event.message = self.resolve_message(event.stage).await;
        }
        self.broadcast(|| BusItem::Event(event.clone()));
    }

    pub fn chunk(&self, content: String, is_final: bool) {
        let chunk = StreamingChunk { content, is_final };
        self.broadcast(|| BusItem::Chunk(chunk.clone()));
    }

    pub fn streaming_complete(&self) {
        self.broadcast(|| BusItem::StreamComplete);
    }

    /// Exactly one of `complete`/`fail` delivers; later calls are ignored.
    pub fn complete(&self, final_text: String, sources: Vec<Source>) {
        if self.terminal_fired.swap(true, Ordering::SeqCst) {
            tracing::debug!("duplicate terminal notification suppressed");
            return;
        }
        self.broadcast(|| BusItem::Completion(final_text.clone(), sources.clone()));
    }

    pub fn fail(&self, error: CoreError) {
        if self.terminal_fired.swap(true, Ordering::SeqCst) {
            tracing::debug!("duplicate terminal notification suppressed");
            return;
        }
        self.broadcast(|| BusItem::Error(error.clone()));
    }

    /// Drain every subscriber queue and wait for the workers to finish.
    pub async fn close(self) {
        for handle in &self.subscribers {
            handle.queue.push(BusItem::Close);
        }
        for handle in self.subscribers {
            if let Err(e) = handle.worker.await {
                tracing::warn!("progress observer worker ended abnormally: {e}");
            }
        }
    }

    fn broadcast(&self, mut make: impl FnMut() -> BusItem) {
        for handle in &self.subscribers {
            handle.queue.push(make());
        }
    }

    async fn resolve_message(&self, stage: ProgressStage) -> String {
        let template = self
            .templates
            .get(stage.as_str())
            .cloned()
            .unwrap_or_else(|| default_template(stage).to_string());

        if !self.auto_generate || stage.is_high_frequency() {
            return template;
        }
        let Some(gateway) = &self.gateway else {
            return template;
        };

        let context = self.context.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let instruction = format!(
            "你是聊天機器人的進度播報員。目前階段：{}。最近的對話：\n{}\n\
             請用不超過16個字的一句話描述目前正在做什麼，口語化、不要標點結尾。",
            stage.as_str(),
            context
        );
        match gateway.blurb(instruction, &CancelToken::new()).await {
            Ok(text) if !text.is_empty() => truncate_blurb(&text),
            Ok(_) => template,
            Err(e) => {
                tracing::debug!("blurb generation failed, using template: {e}");
                template
            }
        }
    }
}

fn truncate_blurb(text: &str) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(BLURB_MAX_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}…")
    } else {
        head
    }
}

pub fn default_template(stage: ProgressStage) -> &'static str {
    match stage {
        ProgressStage::Starting => "初始化中...",
        ProgressStage::GenerateQuery => "正在分析你的問題...",
        ProgressStage::ToolStatus | ProgressStage::ToolExecution => "正在執行工具...",
        ProgressStage::Searching => "正在搜尋相關資料...",
        ProgressStage::Analyzing => "正在分析結果...",
        ProgressStage::Reflection => "正在評估資訊是否足夠...",
        ProgressStage::FinalizeAnswer => "正在整理回答...",
        ProgressStage::Streaming => "回覆輸出中...",
        ProgressStage::Completed => "完成！",
        ProgressStage::Error => "處理時發生錯誤",
        ProgressStage::Timeout => "處理逾時",
    }
}

async fn drain_queue(
    observer: Arc<dyn ProgressObserver>,
    settings: ObserverSettings,
    queue: Arc<SubscriberQueue>,
) {
    let mut buffer = ChunkBuffer::new(&settings);
    loop {
        let Some(item) = queue.pop() else {
            queue.notify.notified().await;
            continue;
        };
        match item {
            BusItem::Event(event) => observer.on_progress(event).await,
            BusItem::Chunk(chunk) => {
                if let Some(merged) = buffer.push(chunk) {
                    observer.on_streaming_chunk(merged).await;
                }
            }
            BusItem::StreamComplete => {
                if let Some(rest) = buffer.drain() {
                    observer.on_streaming_chunk(rest).await;
                }
                observer.on_streaming_complete().await;
            }
            BusItem::Completion(text, sources) => observer.on_completion(text, sources).await,
            BusItem::Error(error) => observer.on_error(error).await,
            BusItem::Close => break,
        }
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;

    /// Records everything it sees, in order.
    #[derive(Default)]
    pub struct RecordingObserver {
        pub log: Mutex<Vec<String>>,
        pub chunks: Mutex<Vec<StreamingChunk>>,
        pub completions: Mutex<Vec<(String, Vec<Source>)>>,
        pub errors: Mutex<Vec<String>>,
    }

    impl RecordingObserver {
        pub fn events(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ProgressObserver for RecordingObserver {
        async fn on_progress(&self, event: ProgressEvent) {
            self.log
                .lock()
                .unwrap()
                .push(format!("progress:{}", event.stage.as_str()));
        }

        async fn on_streaming_chunk(&self, chunk: StreamingChunk) {
            self.log.lock().unwrap().push(format!(
                "chunk{}:{}",
                if chunk.is_final { "!" } else { "" },
                chunk.content
            ));
            self.chunks.lock().unwrap().push(chunk);
        }

        async fn on_streaming_complete(&self) {
            self.log.lock().unwrap().push("stream_complete".into());
        }

        async fn on_completion(&self, final_text: String, sources: Vec<Source>) {
            self.log.lock().unwrap().push(format!("completion:{final_text}"));
            self.completions.lock().unwrap().push((final_text, sources));
        }

        async fn on_error(&self, error: CoreError) {
            self.log.lock().unwrap().push(format!("error:{}", error.code()));
            self.errors.lock().unwrap().push(error.code().to_string());
        }
    }
}
