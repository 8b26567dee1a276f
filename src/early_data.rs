//! Early data 解码
//!
//! 客户端可以把第一个数据块放进握手阶段的 `Sec-WebSocket-Protocol` 头里，
//! 以 URL-safe base64 编码，省去一个往返。

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine as _;
use bytes::Bytes;
use thiserror::Error;

/// 标准字母表，填充可有可无
const ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Error, Debug)]
pub enum EarlyDataError {
    #[error("invalid early data: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// 解码 early data
///
/// 缺失或为空时返回 `Ok(None)`，不算错误。
///
/// # 示例
/// ```
/// use wsproxy_ng::early_data::decode;
///
/// let data = decode(Some("aGVsbG8")).unwrap().unwrap();
/// assert_eq!(&data[..], b"hello");
/// assert!(decode(Some("")).unwrap().is_none());
/// ```
pub fn decode(value: Option<&str>) -> Result<Option<Bytes>, EarlyDataError> {
    let value = match value.map(str::trim) {
        Some(v) if !v.is_empty() => v,
        _ => return Ok(None),
    };

    let standard = value.replace('-', "+").replace('_', "/");
    let bytes = ENGINE.decode(standard)?;
    if bytes.is_empty() {
        return Ok(None);
    }
    Ok(Some(Bytes::from(bytes)))
}
