//! `spark-buffer` 提供定长、定容、可跨线程共享的缓冲池。
//!
//! # 模块定位（Why）
//! - 分帧流的每条连接都需要一对收/发 I/O 缓冲；连接数上限已知时，
//!   在启动阶段一次性预分配全部缓冲，可以让数据面在运行期不再触碰堆分配器。
//! - 池容量固定：耗尽即返回 [`BufferError::Exhausted`]，由调用方视作背压信号自行降载，
//!   池本身既不阻塞也不扩容。
//!
//! # 设计概要（How）
//! - [`BufferPool`] 内部是一块按下标寻址的槽位竞技场（arena），每个槽位要么“在池中”、
//!   要么“已借出”，两种状态由同一把锁下的空闲栈与槽位占用位共同表达；
//! - [`BufferHandle`] 持有借出的存储与槽位下标，并维护 `total_written` / `total_read`
//!   两个累计游标；归还后句柄进入“已脱离”状态，不再能读写任何字节；
//! - 仍处于借出状态的句柄在 `Drop` 时会自动归还，避免遗漏归还造成池容量永久缩水。
//!
//! # 命名约定（Consistency）
//! - `acquire` / `release` / `drain` 与连接层的资源池保持同名语义，便于调用端对照阅读。

mod error;
mod handle;
mod pool;

pub use error::BufferError;
pub use handle::BufferHandle;
pub use pool::{BufferPool, MAX_BUFFER_LENGTH};
