//! 由表结构生成的 SQL 语句

use trellis_domain_core::TableMeta;
use trellis_ports::{Command, IsolationLevel};

/// 加双引号的标识符，`schema.table` 逐段处理
pub fn quote_ident(name: &str) -> String {
    name.split('.')
        .map(|part| format!("\"{}\"", part.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(".")
}

fn column_list(table: &TableMeta) -> String {
    table
        .select_columns()
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn select_all(table: &TableMeta) -> String {
    format!("SELECT {} FROM {}", column_list(table), quote_ident(table.name))
}

pub fn select_by_key(table: &TableMeta) -> String {
    format!(
        "SELECT {} FROM {} WHERE {} = $1",
        column_list(table),
        quote_ident(table.name),
        quote_ident(table.key)
    )
}

pub fn insert(table: &TableMeta) -> String {
    let columns = table
        .columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = (1..=table.columns.len())
        .map(|i| format!("${}", i))
        .collect::<Vec<_>>()
        .join(", ");

    if table.columns.is_empty() {
        format!(
            "INSERT INTO {} DEFAULT VALUES RETURNING {}",
            quote_ident(table.name),
            quote_ident(table.key)
        )
    } else {
        format!(
            "INSERT INTO {} ({}) VALUES ({}) RETURNING {}",
            quote_ident(table.name),
            columns,
            placeholders,
            quote_ident(table.key)
        )
    }
}

/// 主键绑定在最后一个占位符
pub fn update(table: &TableMeta) -> String {
    let assignments = table
        .columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{} = ${}", quote_ident(c), i + 1))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "UPDATE {} SET {} WHERE {} = ${}",
        quote_ident(table.name),
        assignments,
        quote_ident(table.key),
        table.columns.len() + 1
    )
}

pub fn delete(table: &TableMeta) -> String {
    format!(
        "DELETE FROM {} WHERE {} = $1",
        quote_ident(table.name),
        quote_ident(table.key)
    )
}

pub fn begin(isolation: Option<IsolationLevel>) -> String {
    match isolation {
        Some(level) => format!("BEGIN ISOLATION LEVEL {}", level.as_sql()),
        None => "BEGIN".to_string(),
    }
}

/// 存储过程按函数调用：`SELECT * FROM name(p => $1, ...)`
///
/// 只传输入参数，使用命名参数写法；名称原样保留，由数据库按自身规则折叠大小写。
pub fn call_procedure(command: &Command) -> String {
    let arguments = command
        .input_parameters()
        .enumerate()
        .map(|(i, p)| match &p.type_name {
            Some(type_name) => format!("{} => ${}::{}", p.normalized_name(), i + 1, type_name),
            None => format!("{} => ${}", p.normalized_name(), i + 1),
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!("SELECT * FROM {}({})", command.text, arguments)
}
