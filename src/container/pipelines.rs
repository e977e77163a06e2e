//! The three provisioning pipelines, built once at startup.

use super::context::{CreateContext, PostCreateContext, UserSetupContext};
use super::{create, post_create, user_setup};
use crate::pipeline::{Pipeline, PipelineBuilder};

pub struct Pipelines {
    pub create: Pipeline<CreateContext>,
    pub post_create: Pipeline<PostCreateContext>,
    pub user_setup: Pipeline<UserSetupContext>,
}

impl Pipelines {
    pub fn build() -> Self {
        let mut c = PipelineBuilder::new("create");
        create::register(&mut c);
        let mut pc = PipelineBuilder::new("post_create");
        post_create::register(&mut pc);
        let mut us = PipelineBuilder::new("user_setup");
        user_setup::register(&mut us);
        Self {
            create: c.build(),
            post_create: pc.build(),
            user_setup: us.build(),
        }
    }
}

impl std::fmt::Debug for Pipelines {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entry(&self.create)
            .entry(&self.post_create)
            .entry(&self.user_setup)
            .finish()
    }
}
