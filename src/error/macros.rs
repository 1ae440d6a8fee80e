//! # 错误处理宏

/// 快速创建配置错误的宏
#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::error::ProxyError::config($msg)
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::ProxyError::config(format!($fmt, $($arg)*))
    };
}

/// 快速创建业务错误的宏
#[macro_export]
macro_rules! business_error {
    ($msg:expr) => {
        $crate::error::ProxyError::business($msg)
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::ProxyError::business(format!($fmt, $($arg)*))
    };
}

/// 确保条件成立，否则返回业务错误
#[macro_export]
macro_rules! ensure_business {
    ($cond:expr, $msg:expr) => {
        if !($cond) {
            return Err($crate::business_error!($msg));
        }
    };
    ($cond:expr, $fmt:expr, $($arg:tt)*) => {
        if !($cond) {
            return Err($crate::business_error!($fmt, $($arg)*));
        }
    };
}
