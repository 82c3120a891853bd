//! 存储过程 / 原始命令的描述与结果集

use trellis_domain_core::{Record, Value};

/// 命令类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// 按名称调用的存储过程
    StoredProcedure,
    /// 原始 SQL 文本
    Text,
}

/// 参数方向
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ParameterDirection {
    #[default]
    Input,
    Output,
    InputOutput,
    ReturnValue,
}

impl ParameterDirection {
    /// 是否需要把值传给数据库
    pub fn is_input(&self) -> bool {
        matches!(self, Self::Input | Self::InputOutput)
    }

    /// 是否从结果中回填
    pub fn is_output(&self) -> bool {
        matches!(self, Self::Output | Self::InputOutput | Self::ReturnValue)
    }
}

/// 命令参数
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: String,
    /// NULL 以带类型的空值表示，不会被省略
    pub value: Value,
    pub direction: ParameterDirection,
    /// 可选的数据库类型名，用于显式类型转换（例如 `jsonb`）
    pub type_name: Option<String>,
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            direction: ParameterDirection::Input,
            type_name: None,
        }
    }

    pub fn with_direction(mut self, direction: ParameterDirection) -> Self {
        self.direction = direction;
        self
    }

    /// 去掉 `@` 前缀后的参数名
    pub fn normalized_name(&self) -> &str {
        self.name.trim_start_matches('@')
    }
}

/// 结果集的读取方式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CommandBehavior {
    #[default]
    Default,
    /// 只保留第一个结果集
    SingleResult,
    /// 只保留第一个结果集的第一行
    SingleRow,
}

/// 待执行的命令
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub text: String,
    pub kind: CommandKind,
    pub parameters: Vec<Parameter>,
}

impl Command {
    pub fn stored_procedure(name: impl Into<String>) -> Self {
        Self {
            text: name.into(),
            kind: CommandKind::StoredProcedure,
            parameters: Vec::new(),
        }
    }

    pub fn text(sql: impl Into<String>) -> Self {
        Self {
            text: sql.into(),
            kind: CommandKind::Text,
            parameters: Vec::new(),
        }
    }

    /// 需要传入数据库的参数
    pub fn input_parameters(&self) -> impl Iterator<Item = &Parameter> {
        self.parameters.iter().filter(|p| p.direction.is_input())
    }

    /// 需要回填的参数
    pub fn output_parameters(&self) -> impl Iterator<Item = &Parameter> {
        self.parameters.iter().filter(|p| p.direction.is_output())
    }
}

/// 一个结果集
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Record>,
}

impl ResultSet {
    pub fn new(columns: Vec<String>, rows: Vec<Record>) -> Self {
        Self { columns, rows }
    }

    /// 列名取自第一行
    pub fn from_rows(rows: Vec<Record>) -> Self {
        let columns = rows
            .first()
            .map(|row| row.column_names().map(str::to_string).collect())
            .unwrap_or_default();
        Self { columns, rows }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn first_row(&self) -> Option<&Record> {
        self.rows.first()
    }
}
