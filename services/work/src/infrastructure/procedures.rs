//! 存储过程读取

use std::sync::Arc;

use trellis_errors::AppResult;
use trellis_persistence::{CommandBehavior, DbUnitOfWork};

use crate::domain::Work;

pub struct WorkProcedures {
    uow: Arc<DbUnitOfWork>,
}

impl WorkProcedures {
    pub fn new(uow: Arc<DbUnitOfWork>) -> Self {
        Self { uow }
    }

    /// `spGetWorks`：没有结果集时返回空列表
    pub async fn get_all_from_procedure(&self) -> AppResult<Vec<Work>> {
        self.uow
            .load_procedure("spGetWorks", true)
            .execute(CommandBehavior::Default, true, |results| {
                results.read_next_list_or_empty::<Work>()
            })
            .await
    }

    /// `spFindWorks @name`，名称为空时不过滤
    pub async fn find_by_name(&self, name: Option<&str>) -> AppResult<Vec<Work>> {
        self.uow
            .load_procedure("spFindWorks", true)
            .with_parameter("@name", name.map(str::to_string))?
            .execute_for_list::<Work>()
            .await
    }
}
