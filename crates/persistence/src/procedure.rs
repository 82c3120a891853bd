//! 存储过程 / 原始命令执行桥
//!
//! 命令绕过 Repository，直接在 Unit of Work 的会话上执行（有活动事务时即在该事务内），
//! 结果集整体缓冲后交给处理函数按顺序读取。

use std::sync::{Arc, LazyLock, Weak};

use metrics::counter;
use tokio::runtime::Handle;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use trellis_domain_core::{FromRecord, FromValue, Record, Value};
use trellis_errors::{AppError, AppResult};
use trellis_ports::{Command, CommandBehavior, Parameter, ParameterDirection, ResultSet};
use trellis_telemetry::PROCEDURE_EXECUTIONS_TOTAL;

use crate::cancel::cancellable;
use crate::context::{ContextState, DbContext};

/// 进程级连接打开锁，只保护“检查并打开”这一步
static CONNECTION_OPEN_LOCK: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

pub(crate) async fn open_connection(state: &mut ContextState) -> AppResult<()> {
    let _guard = CONNECTION_OPEN_LOCK.lock().await;
    if !state.session.is_open() {
        state.session.open().await?;
        debug!("Connection opened for command execution");
    }
    Ok(())
}

/// 待执行的存储过程或原始命令
pub struct ProcedureCommand {
    context: Weak<DbContext>,
    command: Command,
    cancel: Option<CancellationToken>,
}

impl ProcedureCommand {
    pub(crate) fn new(context: Weak<DbContext>, command: Command) -> Self {
        Self {
            context,
            command,
            cancel: None,
        }
    }

    /// 已构建的命令
    pub fn command(&self) -> &Command {
        &self.command
    }

    /// 追加输入参数；`None` 以带类型的 NULL 传递
    pub fn with_parameter(self, name: impl Into<String>, value: impl Into<Value>) -> AppResult<Self> {
        self.with_parameter_config(name, value, ParameterDirection::Input, |_| {})
    }

    pub fn with_parameter_dir(
        self,
        name: impl Into<String>,
        value: impl Into<Value>,
        direction: ParameterDirection,
    ) -> AppResult<Self> {
        self.with_parameter_config(name, value, direction, |_| {})
    }

    /// 追加参数，并在加入命令前交给 `configure` 调整（例如设置 `type_name`）
    pub fn with_parameter_config(
        mut self,
        name: impl Into<String>,
        value: impl Into<Value>,
        direction: ParameterDirection,
        configure: impl FnOnce(&mut Parameter),
    ) -> AppResult<Self> {
        if self.command.text.trim().is_empty() {
            return Err(AppError::misuse(
                "cannot bind a parameter before a command text is loaded",
            ));
        }
        if self.context.strong_count() == 0 {
            return Err(AppError::misuse(
                "cannot bind a parameter to a command whose unit of work was disposed",
            ));
        }

        let mut parameter = Parameter::new(name, value).with_direction(direction);
        configure(&mut parameter);
        self.command.parameters.push(parameter);
        Ok(self)
    }

    /// 执行期间监听取消信号
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// 执行命令并把结果游标交给 `handler`
    ///
    /// 连接未打开时先打开。`manage_connection` 为 true 时执行后关闭连接，
    /// 但活动事务期间连接保持打开。
    pub async fn execute<R, F>(
        self,
        behavior: CommandBehavior,
        manage_connection: bool,
        handler: F,
    ) -> AppResult<R>
    where
        F: FnOnce(&mut ProcedureResults) -> AppResult<R>,
    {
        let context = self.context.upgrade().ok_or_else(|| {
            AppError::misuse("command executed after its unit of work was disposed")
        })?;
        let cancel = self.cancel.unwrap_or_default();
        let command = self.command;

        let sets = cancellable(&cancel, run(&context, &command, manage_connection)).await?;

        counter!(PROCEDURE_EXECUTIONS_TOTAL, "procedure" => command.text.clone()).increment(1);
        debug!(
            procedure = %command.text,
            result_sets = sets.len(),
            "Command executed"
        );

        let mut results = ProcedureResults::new(sets, behavior, &command);
        handler(&mut results)
    }

    /// 同步执行：在给定运行时上驱动 [`execute`](Self::execute)，不能在运行时线程内调用
    pub fn execute_blocking<R, F>(
        self,
        handle: &Handle,
        behavior: CommandBehavior,
        manage_connection: bool,
        handler: F,
    ) -> AppResult<R>
    where
        F: FnOnce(&mut ProcedureResults) -> AppResult<R>,
    {
        handle.block_on(self.execute(behavior, manage_connection, handler))
    }

    /// 第一个结果集映射为列表（无结果集时为空）
    pub async fn execute_for_list<T: FromRecord>(self) -> AppResult<Vec<T>> {
        self.execute(CommandBehavior::SingleResult, false, |results| {
            results.read_to_list()
        })
        .await
    }

    /// 第一个结果集的第一行
    pub async fn execute_for_first<T: FromRecord>(self) -> AppResult<Option<T>> {
        self.execute(CommandBehavior::SingleRow, false, |results| {
            Ok(results.read_to_list::<T>()?.into_iter().next())
        })
        .await
    }
}

async fn run(
    context: &Arc<DbContext>,
    command: &Command,
    manage_connection: bool,
) -> AppResult<Vec<ResultSet>> {
    let mut state = context.lock().await;
    open_connection(&mut state).await?;

    let outcome = state.session.execute(command).await;

    if manage_connection {
        if state.transaction.is_some() {
            debug!("Transaction active, keeping connection open");
        } else if let Err(e) = state.session.close().await {
            if outcome.is_ok() {
                return Err(e);
            }
            warn!(error = %e, "Failed to close connection after failed command");
        }
    }

    outcome
}

/// 只进的结果集游标
#[derive(Debug)]
pub struct ProcedureResults {
    sets: Vec<ResultSet>,
    current: usize,
    outputs: Record,
}

impl ProcedureResults {
    pub(crate) fn new(mut sets: Vec<ResultSet>, behavior: CommandBehavior, command: &Command) -> Self {
        let outputs = collect_outputs(&sets, command);

        match behavior {
            CommandBehavior::Default => {}
            CommandBehavior::SingleResult => sets.truncate(1),
            CommandBehavior::SingleRow => {
                sets.truncate(1);
                if let Some(set) = sets.first_mut() {
                    set.rows.truncate(1);
                }
            }
        }

        Self {
            sets,
            current: 0,
            outputs,
        }
    }

    /// 结果集个数
    pub fn result_count(&self) -> usize {
        self.sets.len()
    }

    /// 当前结果集是否有行
    pub fn has_rows(&self) -> bool {
        self.current_set().is_some_and(|set| !set.is_empty())
    }

    /// 当前结果集的列名
    pub fn columns(&self) -> &[String] {
        self.current_set()
            .map(|set| set.columns.as_slice())
            .unwrap_or_default()
    }

    /// 映射当前结果集，不前进
    pub fn read_to_list<T: FromRecord>(&self) -> AppResult<Vec<T>> {
        match self.current_set() {
            Some(set) => set.rows.iter().map(T::from_record).collect(),
            None => Ok(Vec::new()),
        }
    }

    /// 映射当前结果集并前进到下一个；没有行时返回空列表
    pub fn read_next_list_or_empty<T: FromRecord>(&mut self) -> AppResult<Vec<T>> {
        let list = self.read_to_list()?;
        self.next_result();
        Ok(list)
    }

    /// 当前结果集第一行第一列的值；没有行或为 NULL 时为 `None`
    pub fn read_to_value<T: FromValue>(&self) -> AppResult<Option<T>> {
        let Some(value) = self
            .current_set()
            .and_then(ResultSet::first_row)
            .and_then(Record::first_value)
        else {
            return Ok(None);
        };
        if value.is_null() {
            return Ok(None);
        }
        T::from_value(value).map_err(AppError::from)
    }

    /// 前进到下一个结果集，返回是否还有结果集
    pub fn next_result(&mut self) -> bool {
        if self.current < self.sets.len() {
            self.current += 1;
        }
        self.current < self.sets.len()
    }

    /// 读取输出参数（名称不区分大小写，可带 `@` 前缀）
    pub fn output<T: FromValue>(&self, name: &str) -> AppResult<Option<T>> {
        self.outputs.try_get(name.trim_start_matches('@'))
    }

    fn current_set(&self) -> Option<&ResultSet> {
        self.sets.get(self.current)
    }
}

/// 输出参数取第一个结果集第一行的同名列
fn collect_outputs(sets: &[ResultSet], command: &Command) -> Record {
    let first_row = sets.first().and_then(ResultSet::first_row);
    command
        .output_parameters()
        .map(|parameter| {
            let name = parameter.normalized_name();
            let value = first_row
                .and_then(|row| row.value(name))
                .cloned()
                .unwrap_or_else(|| parameter.value.clone());
            (name.to_string(), value)
        })
        .collect()
}
