//! 泛型 Repository
//!
//! 每个实现类型一个实例，由 Unit of Work 缓存。`save = true` 的写操作会刷新整个
//! Unit of Work 的暂存更改，而不只是本 Repository 的。

use std::marker::PhantomData;
use std::sync::{Arc, Weak};

use tokio::runtime::Handle;
use trellis_domain_core::{Entity, EntityKey, is_temporary_key};
use trellis_errors::{AppError, AppResult};
use trellis_ports::Command;

use crate::context::{ContextState, DbContext, build_record};
use crate::procedure::ProcedureCommand;

/// 实体 `T` 的 CRUD 入口
pub struct Repository<T: Entity> {
    context: Weak<DbContext>,
    _entity: PhantomData<fn() -> T>,
}

impl<T: Entity> Repository<T> {
    pub(crate) fn new(context: Weak<DbContext>) -> Self {
        Self {
            context,
            _entity: PhantomData,
        }
    }

    fn context(&self) -> AppResult<Arc<DbContext>> {
        self.context.upgrade().ok_or_else(|| {
            AppError::misuse(format!(
                "repository for '{}' used after its unit of work was disposed",
                T::TABLE.name
            ))
        })
    }

    /// 读取整张表
    ///
    /// 有暂存更改的行不覆盖标识映射，之后的 `find` 仍返回暂存的值。
    pub async fn get_all(&self) -> AppResult<Vec<T>> {
        let context = self.context()?;
        let mut state = context.lock().await;

        let rows = state.session.select_all(&T::TABLE).await?;
        let mut entities = Vec::with_capacity(rows.len());
        for row in rows {
            let entity = T::from_record(&row)?;
            if !state.tracker.has_pending(&T::TABLE, entity.id()) {
                state.identity.put(&T::TABLE, entity.id(), row);
            }
            entities.push(entity);
        }
        Ok(entities)
    }

    /// 按主键查找，找不到时返回 `None`
    ///
    /// 先查会话内的标识映射，其次是尚未刷新的插入，最后才访问数据库。
    pub async fn find(&self, id: EntityKey) -> AppResult<Option<T>> {
        let context = self.context()?;
        let mut state = context.lock().await;
        find_in(&mut state, id).await
    }

    /// 同步查找：在给定运行时上驱动 [`find`](Self::find)，不能在运行时线程内调用
    pub fn find_blocking(&self, handle: &Handle, id: EntityKey) -> AppResult<Option<T>> {
        handle.block_on(self.find(id))
    }

    /// 暂存插入；`save` 为 true 时立即刷新，并回填数据库分配的主键
    ///
    /// 不刷新时实体得到一个负数临时键，可以作为其他暂存实体的外键值。
    pub async fn insert(&self, entity: &mut T, save: bool) -> AppResult<()> {
        self.insert_range(std::slice::from_mut(entity), save).await
    }

    /// 批量暂存插入，空输入不做任何事
    pub async fn insert_range(&self, entities: &mut [T], save: bool) -> AppResult<()> {
        if entities.is_empty() {
            return Ok(());
        }
        let context = self.context()?;
        let mut state = context.lock().await;

        for entity in entities.iter() {
            ensure_insertable(&state, entity)?;
        }
        for entity in entities.iter_mut() {
            let key = state.tracker.stage_insert(T::TABLE, entity.values());
            entity.set_id(key);
        }

        if save {
            state.flush().await?;
            for entity in entities.iter_mut() {
                entity.set_id(state.tracker.resolve(entity.id()));
            }
        }
        Ok(())
    }

    /// 暂存整行更新
    pub async fn update(&self, entity: &T, save: bool) -> AppResult<()> {
        if entity.id() == 0 {
            return Err(AppError::misuse(format!(
                "cannot update a '{}' that was never inserted",
                T::TABLE.name
            )));
        }
        let context = self.context()?;
        let mut state = context.lock().await;

        let values = entity.values();
        let key = state.tracker.resolve(entity.id());
        state.tracker.stage_update(T::TABLE, key, values.clone())?;
        if !is_temporary_key(key) {
            state
                .identity
                .put(&T::TABLE, key, build_record(&T::TABLE, key, &values));
        }

        if save {
            state.flush().await?;
        }
        Ok(())
    }

    /// 按主键删除；不存在时静默返回，不刷新
    pub async fn delete_by_id(&self, id: EntityKey, save: bool) -> AppResult<()> {
        let context = self.context()?;
        let mut state = context.lock().await;

        let Some(entity) = find_in::<T>(&mut state, id).await? else {
            return Ok(());
        };
        state.tracker.stage_delete(T::TABLE, entity.id());

        if save {
            state.flush().await?;
        }
        Ok(())
    }

    /// 删除一个已加载的实体
    pub async fn delete(&self, entity: &T, save: bool) -> AppResult<()> {
        self.delete_range(std::slice::from_ref(entity), save).await
    }

    /// 批量删除，空输入不做任何事
    pub async fn delete_range(&self, entities: &[T], save: bool) -> AppResult<()> {
        if entities.is_empty() {
            return Ok(());
        }
        if let Some(entity) = entities.iter().find(|e| e.id() == 0) {
            return Err(AppError::misuse(format!(
                "cannot delete a '{}' that was never inserted (id {})",
                T::TABLE.name,
                entity.id()
            )));
        }
        let context = self.context()?;
        let mut state = context.lock().await;

        for entity in entities {
            state.tracker.stage_delete(T::TABLE, entity.id());
        }

        if save {
            state.flush().await?;
        }
        Ok(())
    }

    /// 满足条件的实体（在 `get_all` 结果上过滤）
    pub async fn filter<P>(&self, predicate: P) -> AppResult<Vec<T>>
    where
        P: Fn(&T) -> bool,
    {
        Ok(self.get_all().await?.into_iter().filter(|e| predicate(e)).collect())
    }

    pub async fn first_where<P>(&self, predicate: P) -> AppResult<Option<T>>
    where
        P: Fn(&T) -> bool,
    {
        Ok(self.get_all().await?.into_iter().find(|e| predicate(e)))
    }

    pub async fn any<P>(&self, predicate: P) -> AppResult<bool>
    where
        P: Fn(&T) -> bool,
    {
        Ok(self.get_all().await?.iter().any(predicate))
    }

    pub async fn count(&self) -> AppResult<usize> {
        Ok(self.get_all().await?.len())
    }

    pub async fn count_where<P>(&self, predicate: P) -> AppResult<usize>
    where
        P: Fn(&T) -> bool,
    {
        Ok(self.get_all().await?.iter().filter(|e| predicate(e)).count())
    }

    /// 唯一满足条件的实体；多于一个时返回 `Conflict`
    pub async fn single_where<P>(&self, predicate: P) -> AppResult<Option<T>>
    where
        P: Fn(&T) -> bool,
    {
        let mut matches = self.get_all().await?.into_iter().filter(|e| predicate(e));
        let first = matches.next();
        if matches.next().is_some() {
            return Err(AppError::conflict(format!(
                "more than one '{}' matches the predicate",
                T::TABLE.name
            )));
        }
        Ok(first)
    }

    pub async fn last_where<P>(&self, predicate: P) -> AppResult<Option<T>>
    where
        P: Fn(&T) -> bool,
    {
        Ok(self.get_all().await?.into_iter().rev().find(|e| predicate(e)))
    }

    /// 按键排序的全部实体（稳定排序）
    pub async fn order_by<K, F>(&self, key: F) -> AppResult<Vec<T>>
    where
        K: Ord,
        F: Fn(&T) -> K,
    {
        let mut entities = self.get_all().await?;
        entities.sort_by_key(|e| key(e));
        Ok(entities)
    }

    /// 在同一会话上调用存储过程（自动加默认 schema 前缀）
    pub fn load_procedure(&self, name: &str) -> ProcedureCommand {
        let command = match self.context.upgrade() {
            Some(context) => qualified_procedure(context.default_schema(), name, true),
            None => Command::stored_procedure(name),
        };
        ProcedureCommand::new(self.context.clone(), command)
    }

    /// 在同一会话上执行原始 SQL
    pub fn load_command(&self, text: &str) -> ProcedureCommand {
        ProcedureCommand::new(self.context.clone(), Command::text(text))
    }
}

async fn find_in<T: Entity>(state: &mut ContextState, id: EntityKey) -> AppResult<Option<T>> {
    let key = state.tracker.resolve(id);

    if let Some(record) = state.identity.get(&T::TABLE, key) {
        return T::from_record(record).map(Some);
    }
    if is_temporary_key(key) {
        return match state.tracker.staged_insert(&T::TABLE, key) {
            Some(change) => T::from_record(&build_record(&T::TABLE, key, &change.values)).map(Some),
            None => Ok(None),
        };
    }

    match state.session.select_by_key(&T::TABLE, key).await? {
        Some(row) => {
            let entity = T::from_record(&row)?;
            state.identity.put(&T::TABLE, key, row);
            Ok(Some(entity))
        }
        None => Ok(None),
    }
}

fn ensure_insertable<T: Entity>(state: &ContextState, entity: &T) -> AppResult<()> {
    let id = entity.id();
    // 已刷新的临时键只留在键映射里
    if id > 0
        || state.tracker.staged_insert(&T::TABLE, id).is_some()
        || state.tracker.resolved_key(id).is_some()
    {
        return Err(AppError::misuse(format!(
            "'{}' {} is already persisted or staged for insert",
            T::TABLE.name,
            id
        )));
    }
    Ok(())
}

/// 存储过程名，按需加默认 schema 前缀（已带 schema 的名称不变）
pub(crate) fn qualified_procedure(schema: Option<&str>, name: &str, prepend: bool) -> Command {
    match schema {
        Some(schema) if prepend && !name.contains('.') => {
            Command::stored_procedure(format!("{}.{}", schema, name))
        }
        _ => Command::stored_procedure(name),
    }
}
