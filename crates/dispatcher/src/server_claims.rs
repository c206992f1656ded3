use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

/// 服务器认领表
///
/// 一台服务器同一时间最多绑定一个 Job。认领是原子的：检查和写入在同一把锁内完成。
#[derive(Debug, Clone, Default)]
pub struct ServerClaims {
    owners: Arc<Mutex<HashMap<i64, String>>>,
}

impl ServerClaims {
    pub fn new() -> Self {
        Self::default()
    }

    /// 尝试认领服务器，已被同一个所有者认领时也返回 true
    pub async fn try_claim(&self, server_id: i64, owner: &str) -> bool {
        let mut owners = self.owners.lock().await;
        match owners.get(&server_id) {
            Some(current) if current != owner => false,
            Some(_) => true,
            None => {
                owners.insert(server_id, owner.to_string());
                debug!("服务器 {} 被 {} 认领", server_id, owner);
                true
            }
        }
    }

    /// 释放认领，只有所有者本人可以释放
    pub async fn release(&self, server_id: i64, owner: &str) {
        let mut owners = self.owners.lock().await;
        if owners.get(&server_id).map(|o| o == owner).unwrap_or(false) {
            owners.remove(&server_id);
            debug!("服务器 {} 被 {} 释放", server_id, owner);
        }
    }

    pub async fn is_claimed(&self, server_id: i64) -> bool {
        self.owners.lock().await.contains_key(&server_id)
    }

    pub async fn owner(&self, server_id: i64) -> Option<String> {
        self.owners.lock().await.get(&server_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let claims = ServerClaims::new();

        assert!(claims.try_claim(1, "HeuristicChecker#1").await);
        assert!(claims.try_claim(1, "HeuristicChecker#1").await);
        assert!(!claims.try_claim(1, "HeuristicChecker#2").await);

        // 非所有者的释放无效
        claims.release(1, "HeuristicChecker#2").await;
        assert_eq!(claims.owner(1).await.as_deref(), Some("HeuristicChecker#1"));

        claims.release(1, "HeuristicChecker#1").await;
        assert!(!claims.is_claimed(1).await);
        assert!(claims.try_claim(1, "HeuristicChecker#2").await);
    }

    #[tokio::test]
    async fn test_concurrent_claims_have_single_winner() {
        let claims = ServerClaims::new();
        let mut handles = Vec::new();
        for i in 0..16 {
            let claims = claims.clone();
            handles.push(tokio::spawn(async move {
                claims.try_claim(7, &format!("job#{i}")).await
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
