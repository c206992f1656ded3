//! 消息模型与线路编码
//!
//! 一条消息在线路上是一行文本：`NAME p1 p2 ...`，以单个空格分隔。
//! 字符串参数中的 `'` 编码为 `\'`，换行编码为 `\n`；当参数包含空格或被编码过时，
//! 整个参数用单引号包裹。解析时未加引号的参数依次尝试整数、浮点数，最后作为字符串。

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::SchedulerError;
use crate::SchedulerResult;

/// 消息参数值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Float(f64),
    Str(String),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(value) => Some(value.as_str()),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(value) => write!(f, "{value}"),
            // 整数值的浮点数保留一位小数，避免解析时被识别为整数
            Value::Float(value) if value.is_finite() && value.fract() == 0.0 => {
                write!(f, "{value:.1}")
            }
            Value::Float(value) => write!(f, "{value}"),
            Value::Str(value) => f.write_str(value),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value as i64)
    }
}

impl From<u16> for Value {
    fn from(value: u16) -> Self {
        Value::Int(value as i64)
    }
}

impl From<usize> for Value {
    fn from(value: usize) -> Self {
        Value::Int(value as i64)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

/// 参数类型声明，用于校验命令和事件的参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Int,
    Str,
}

/// 命令或事件的签名：名称加参数类型列表
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageSignature {
    pub name: &'static str,
    pub params: &'static [ParamKind],
}

impl MessageSignature {
    pub const fn new(name: &'static str, params: &'static [ParamKind]) -> Self {
        Self { name, params }
    }
}

/// 统一的消息信封
///
/// 构造后只读，相等性由 (name, parameters) 决定。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    name: String,
    parameters: Vec<Value>,
}

impl Message {
    pub fn new(name: impl Into<String>, parameters: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            parameters,
        }
    }

    /// 创建不带参数的消息
    pub fn named(name: impl Into<String>) -> Self {
        Self::new(name, Vec::new())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parameters(&self) -> &[Value] {
        &self.parameters
    }

    pub fn param(&self, index: usize) -> Option<&Value> {
        self.parameters.get(index)
    }

    pub fn is(&self, name: &str) -> bool {
        self.name == name
    }

    /// 读取整数参数
    pub fn int_param(&self, index: usize) -> SchedulerResult<i64> {
        match self.parameters.get(index) {
            Some(Value::Int(value)) => Ok(*value),
            Some(other) => Err(SchedulerError::InvalidMessage(format!(
                "{} 的第 {} 个参数不是整数: {other}",
                self.name,
                index + 1
            ))),
            None => Err(SchedulerError::InvalidMessage(format!(
                "{} 缺少第 {} 个参数",
                self.name,
                index + 1
            ))),
        }
    }

    /// 以字符串形式读取参数（任何类型的参数都可以）
    pub fn str_param(&self, index: usize) -> SchedulerResult<String> {
        self.parameters
            .get(index)
            .map(|value| value.to_string())
            .ok_or_else(|| {
                SchedulerError::InvalidMessage(format!(
                    "{} 缺少第 {} 个参数",
                    self.name,
                    index + 1
                ))
            })
    }

    /// 按签名校验参数个数并转换参数类型
    pub fn conform(&self, kinds: &[ParamKind]) -> SchedulerResult<Message> {
        if kinds.len() != self.parameters.len() {
            return Err(SchedulerError::InvalidMessage(format!(
                "参数个数错误, 期望 {}, 收到消息: {self}",
                kinds.len()
            )));
        }

        let parameters = kinds
            .iter()
            .zip(self.parameters.iter())
            .map(|(kind, value)| match (kind, value) {
                (ParamKind::Int, Value::Int(v)) => Ok(Value::Int(*v)),
                (ParamKind::Int, Value::Float(v)) if v.is_finite() => Ok(Value::Int(v.trunc() as i64)),
                (ParamKind::Int, Value::Str(v)) => v.trim().parse::<i64>().map(Value::Int).map_err(|_| {
                    SchedulerError::InvalidMessage(format!("参数类型错误, 期望整数, 收到消息: {self}"))
                }),
                (ParamKind::Int, _) => Err(SchedulerError::InvalidMessage(format!(
                    "参数类型错误, 期望整数, 收到消息: {self}"
                ))),
                (ParamKind::Str, v) => Ok(Value::Str(v.to_string())),
            })
            .collect::<SchedulerResult<Vec<_>>>()?;

        Ok(Message::new(self.name.clone(), parameters))
    }

    /// 从一行文本解析消息
    pub fn parse(line: &str) -> SchedulerResult<Message> {
        let line = line.trim_end_matches(['\r', '\n']);
        let mut parts = line.split(' ');

        let name = match parts.next() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => return Err(SchedulerError::InvalidMessage("空消息".to_string())),
        };

        let mut parameters = Vec::new();
        let mut quoted: Option<String> = None;

        for part in parts {
            match quoted.take() {
                None => {
                    if let Some(body) = part.strip_prefix('\'') {
                        if ends_with_unescaped_quote(body) {
                            parameters.push(Value::Str(decode(&body[..body.len() - 1])));
                        } else {
                            quoted = Some(body.to_string());
                        }
                    } else {
                        parameters.push(infer(&decode(part)));
                    }
                }
                Some(mut pending) => {
                    pending.push(' ');
                    if part == "'" || ends_with_unescaped_quote(part) {
                        pending.push_str(&part[..part.len() - 1]);
                        parameters.push(Value::Str(decode(&pending)));
                    } else {
                        pending.push_str(part);
                        quoted = Some(pending);
                    }
                }
            }
        }

        // 未闭合的引号按字符串保留
        if let Some(pending) = quoted {
            parameters.push(Value::Str(decode(&pending)));
        }

        Ok(Message::new(name, parameters))
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        for parameter in &self.parameters {
            let text = parameter.to_string();
            let encoded = encode(&text);
            if encoded != text || encoded.contains(' ') || encoded.is_empty() {
                write!(f, " '{encoded}'")?;
            } else {
                write!(f, " {encoded}")?;
            }
        }
        Ok(())
    }
}

fn ends_with_unescaped_quote(text: &str) -> bool {
    text.ends_with('\'') && !text.ends_with("\\'")
}

fn encode(text: &str) -> String {
    text.replace('\'', "\\'").replace('\n', "\\n")
}

fn decode(text: &str) -> String {
    text.replace("\\'", "'").replace("\\n", "\n")
}

fn infer(token: &str) -> Value {
    if let Ok(value) = token.parse::<i64>() {
        return Value::Int(value);
    }
    match token.parse::<f64>() {
        // "inf"/"nan" 之类的单词保留为字符串
        Ok(value) if value.is_finite() => Value::Float(value),
        _ => Value::Str(token.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_typed_parameters() {
        let message = Message::parse("LOG_FILE Predictor.log 1024").unwrap();
        assert_eq!(message.name(), "LOG_FILE");
        assert_eq!(
            message.parameters(),
            &[Value::Str("Predictor.log".into()), Value::Int(1024)]
        );

        let message = Message::parse("TRAIN_ERROR 0.25").unwrap();
        assert_eq!(message.param(0), Some(&Value::Float(0.25)));
    }

    #[test]
    fn test_quoted_parameters() {
        let message = Message::new(
            "COMPILATION_ERROR",
            vec!["line 1: error\nline 2: it's broken".into()],
        );
        let line = message.to_string();
        assert_eq!(line, "COMPILATION_ERROR 'line 1: error\\nline 2: it\\'s broken'");
        assert!(!line.contains('\n'));
        assert_eq!(Message::parse(&line).unwrap(), message);

        // 单个被编码的词也会加引号
        let message = Message::new("NAME", vec!["it's".into()]);
        assert_eq!(message.to_string(), "NAME 'it\\'s'");
        assert_eq!(Message::parse("NAME 'it\\'s'").unwrap(), message);
    }

    #[test]
    fn test_quoted_number_stays_string() {
        let message = Message::parse("SELECT_TASK 'goal 1' 42").unwrap();
        assert_eq!(
            message.parameters(),
            &[Value::Str("goal 1".into()), Value::Int(42)]
        );
    }

    #[test]
    fn test_float_rendering_keeps_type() {
        let message = Message::new("TEST_ERROR", vec![Value::Float(2.0)]);
        assert_eq!(message.to_string(), "TEST_ERROR 2.0");
        assert_eq!(Message::parse("TEST_ERROR 2.0").unwrap(), message);
    }

    #[test]
    fn test_empty_line_is_rejected() {
        assert!(Message::parse("").is_err());
        assert!(Message::parse("\n").is_err());
    }

    #[test]
    fn test_conform() {
        let message = Message::parse("CHECK_HEURISTIC 42").unwrap();
        let conformed = message.conform(&[ParamKind::Int]).unwrap();
        assert_eq!(conformed.int_param(0).unwrap(), 42);

        let message = Message::new("CLUSTER_HEURISTICS", vec![Value::Int(5)]);
        let conformed = message.conform(&[ParamKind::Str]).unwrap();
        assert_eq!(conformed.param(0), Some(&Value::Str("5".into())));

        assert!(Message::named("CHECK_HEURISTIC")
            .conform(&[ParamKind::Int])
            .is_err());
        assert!(Message::parse("CHECK_HEURISTIC abc")
            .unwrap()
            .conform(&[ParamKind::Int])
            .is_err());
    }

    #[test]
    fn test_equality_by_name_and_parameters() {
        assert_eq!(
            Message::new("RUN_EXPERIMENT", vec![3.into()]),
            Message::parse("RUN_EXPERIMENT 3").unwrap()
        );
        assert_ne!(
            Message::new("RUN_EXPERIMENT", vec![3.into()]),
            Message::new("RUN_EXPERIMENT", vec![4.into()])
        );
    }
}
