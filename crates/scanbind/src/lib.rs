pub mod cancel;
pub mod checkpoint;
pub mod config;
pub mod credentials;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod folders;
pub mod job;
pub mod ocr;
pub mod pdf;
pub mod quota;

pub use cancel::{CancellationToken, Interruptible};
pub use config::{load_config, Config};
pub use credentials::{CredentialRecord, CredentialScanner, ScanReport};
pub use db::{Database, DatabaseError};
pub use dispatch::PageDispatcher;
pub use error::{
    ConfigError, JobError, OcrError, PdfError, QuotaError, Result, ScanbindError,
};
pub use events::{EventBus, JobEvent, JobEventType};
pub use job::{JobOrchestrator, JobStatus, JobView, OutputDirs};
pub use ocr::{OcrEngine, OcrPageResult, OcrWord, VisionClient};
pub use pdf::PdfWriter;
pub use quota::{KeySelectionStrategy, PeriodClock, QuotaAllocator};
