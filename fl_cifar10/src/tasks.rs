use comms::specs::experiment::{Metrics, TaskKind};
use federation::{Result, TaskContext, TaskKeeper};
use log::debug;
use serde_json::Value;

/// Trains the model on the local train split, one epoch unless the `epochs` keyword
/// argument says otherwise.
///
/// # Returns
/// The mean loss of the last epoch as `train_loss`.
pub fn train(ctx: TaskContext<'_>) -> Result<Metrics> {
    let epochs = ctx.kwarg::<usize>("epochs")?.unwrap_or(1).max(1);
    let mut loader = ctx.data.train_loader(ctx.seed)?;
    let mut loss = 0.;

    for epoch in 0..epochs {
        let stats = ctx.state.train_epoch(&mut loader)?;
        debug!(epoch = epoch, loss = stats.loss, device:% = ctx.device; "trained epoch");
        loss = stats.loss;
    }

    Ok([("train_loss".to_string(), loss)].into())
}

/// Measures the model on the local validation split.
///
/// # Returns
/// The accuracy as `acc` and the mean loss as `loss`.
pub fn validate(ctx: TaskContext<'_>) -> Result<Metrics> {
    let mut loader = ctx.data.valid_loader()?;
    let stats = ctx.state.evaluate(&mut loader)?;

    Ok([
        ("acc".to_string(), stats.accuracy),
        ("loss".to_string(), stats.loss),
    ]
    .into())
}

/// Registers `train` and `validate` under their own names.
pub fn task_keeper(epochs: usize) -> Result<TaskKeeper> {
    let mut tasks = TaskKeeper::new();
    tasks.register("train", TaskKind::Train, train)?;
    tasks.add_kwargs("train", [("epochs", Value::from(epochs))])?;
    tasks.register("validate", TaskKind::Validate, validate)?;
    Ok(tasks)
}
