use crate::config::ConfigDoc;
use crate::error::Result;
use crate::planner::Plan;

pub mod addons;
pub mod branding;
pub mod core;
pub mod patches;
pub mod source;
pub mod util;

pub trait Module {
    fn id(&self) -> &'static str;
    fn detect(&self, doc: &ConfigDoc) -> bool;
    fn plan(&self, doc: &ConfigDoc, plan: &mut Plan) -> Result<()>;
}

pub fn builtin_modules() -> Vec<Box<dyn Module>> {
    vec![
        Box::new(core::CoreModule),
        Box::new(source::SourceModule),
        Box::new(addons::AddonsModule),
        Box::new(patches::PatchesModule),
        Box::new(branding::BrandingModule),
    ]
}

/// Plans every module the build definition enables.
pub fn plan_for(doc: &ConfigDoc) -> Result<Plan> {
    let mut plan = Plan::default();
    for m in builtin_modules() {
        if m.detect(doc) {
            m.plan(doc, &mut plan)?;
        }
    }
    plan.validate()?;
    Ok(plan)
}
