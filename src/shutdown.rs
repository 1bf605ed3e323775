use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 优雅关闭管理器
///
/// 所有组件订阅同一个取消令牌；`shutdown` 只生效一次。
#[derive(Clone, Default)]
pub struct ShutdownManager {
    token: CancellationToken,
    is_shutdown: Arc<AtomicBool>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 订阅关闭信号；关闭后订阅得到的令牌立即处于取消状态
    pub fn subscribe(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// 触发关闭
    pub fn shutdown(&self) {
        if self.is_shutdown.swap(true, Ordering::SeqCst) {
            debug!("关闭管理器已经触发过关闭");
            return;
        }
        info!("触发系统关闭");
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown.load(Ordering::SeqCst)
    }

    /// 等待关闭被触发
    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// 收到 SIGINT / SIGTERM 时触发关闭
    pub fn listen_for_signals(&self) {
        let manager = self.clone();
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            manager.shutdown();
        });
    }
}

/// 等待关闭信号
pub async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("安装Ctrl+C信号处理器失败: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("安装SIGTERM信号处理器失败: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("收到Ctrl+C信号");
        },
        _ = terminate => {
            info!("收到SIGTERM信号");
        },
    }
}
