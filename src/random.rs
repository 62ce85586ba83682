//! 安全随机数生成模块
//!
//! 提供 grant handle、设备 user code 等敏感值的生成，以及常量时间比较。

use rand::{Rng, TryRngCore, rngs::OsRng};

use crate::error::{CryptoError, Error, Result};

/// grant handle 的默认熵（字节）
pub const HANDLE_BYTES: usize = 32;

/// 生成指定长度的随机字节数组
///
/// 使用操作系统提供的密码学安全随机数生成器 (CSPRNG)
///
/// # Example
///
/// ```rust
/// use grantrs::random::generate_random_bytes;
///
/// let bytes = generate_random_bytes(32).unwrap();
/// assert_eq!(bytes.len(), 32);
/// ```
pub fn generate_random_bytes(length: usize) -> Result<Vec<u8>> {
    let mut bytes = vec![0u8; length];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| Error::Crypto(CryptoError::RngFailed(format!("{:?}", e))))?;
    Ok(bytes)
}

/// 生成指定长度的 Base64 URL 安全随机字符串（不含填充）
///
/// # Example
///
/// ```rust
/// use grantrs::random::generate_random_base64_url;
///
/// let token = generate_random_base64_url(32).unwrap();
/// assert!(!token.contains('+'));
/// assert!(!token.contains('/'));
/// ```
pub fn generate_random_base64_url(byte_length: usize) -> Result<String> {
    use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
    let bytes = generate_random_bytes(byte_length)?;
    Ok(URL_SAFE_NO_PAD.encode(&bytes))
}

/// 生成交给客户端的不透明 grant handle
///
/// 256 位熵，base64url 编码后为 43 个字符
pub fn generate_handle() -> Result<String> {
    generate_random_base64_url(HANDLE_BYTES)
}

/// 设备流 user code 使用的字符集（排除容易混淆的字符如 0, O, I, 1）
pub const USER_CODE_CHARSET: &[u8] = b"BCDFGHJKLMNPQRSTVWXZ23456789";

/// 生成人类可读的设备 user code
///
/// 长度大于 4 时每 4 个字符插入一个 `-`，便于用户输入
///
/// # Example
///
/// ```rust
/// use grantrs::random::generate_user_code;
///
/// let code = generate_user_code(8).unwrap();
/// assert_eq!(code.len(), 9);
/// assert_eq!(&code[4..5], "-");
/// ```
pub fn generate_user_code(length: usize) -> Result<String> {
    if length == 0 {
        return Err(Error::invalid_config(
            "device_flow.user_code_length",
            "user code length must be positive",
        ));
    }

    let mut rng = rand::rng();
    let mut code = String::with_capacity(length + length / 4);
    for i in 0..length {
        if i > 0 && i % 4 == 0 {
            code.push('-');
        }
        let idx = rng.random_range(0..USER_CODE_CHARSET.len());
        code.push(USER_CODE_CHARSET[idx] as char);
    }

    Ok(code)
}

/// 规范化用户输入的 user code：去掉分隔符与空白并转为大写
pub fn normalize_user_code(input: &str) -> String {
    input
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// 将字节数组编码为十六进制字符串
pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// 常量时间比较两个字节切片
///
/// # Example
///
/// ```rust
/// use grantrs::random::constant_time_compare;
///
/// assert!(constant_time_compare(b"secret_token", b"secret_token"));
/// assert!(!constant_time_compare(b"secret_token", b"other_token!"));
/// ```
pub fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    use subtle::ConstantTimeEq;
    a.ct_eq(b).into()
}

/// 常量时间比较两个字符串
pub fn constant_time_compare_str(a: &str, b: &str) -> bool {
    constant_time_compare(a.as_bytes(), b.as_bytes())
}
