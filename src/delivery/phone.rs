//! 目标号码规范化

/// 协议用户地址后缀
pub const USER_SUFFIX: &str = "@s.whatsapp.net";

/// 只保留数字；没有数字时返回 None
pub fn normalize_digits(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    (!digits.is_empty()).then_some(digits)
}

/// 旧客户端的用户地址后缀，发送前换成 USER_SUFFIX
pub const LEGACY_USER_SUFFIX: &str = "@c.us";

/// 格式化为协议地址 `<digits>@s.whatsapp.net`；`@c.us` 地址换后缀，其余带 `@` 的地址原样返回
pub fn format_destination(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if let Some(user) = raw.strip_suffix(LEGACY_USER_SUFFIX) {
        return normalize_digits(user).map(|digits| format!("{}{}", digits, USER_SUFFIX));
    }
    if raw.contains('@') {
        return Some(raw.to_string());
    }
    normalize_digits(raw).map(|digits| format!("{}{}", digits, USER_SUFFIX))
}
