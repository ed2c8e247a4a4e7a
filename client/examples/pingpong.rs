//! Two processes ping-pong over named semaphores. Run a session daemon
//! first (`dsm_daemon`) and make sure `dsm_arbiter` is in PATH; this
//! binary forks and both halves join the cohort.

use dsm_client::Config;

fn main() -> anyhow::Result<()> {
    // Each process must init once; fork before the call.
    unsafe { nix::unistd::fork() }?;

    let dsm = dsm_client::init(Config::simple("pingpong", 2, 4096))?;

    // Each fresh semaphore carries one token: gid 0 takes sem_zero's,
    // gid 1 takes sem_one's and blocks on the second down.
    if dsm.gid() == 0 {
        dsm.wait_sem("sem_zero")?;
    } else {
        dsm.wait_sem("sem_one")?;
        dsm.wait_sem("sem_one")?;
    }

    for _ in 0..5 {
        if dsm.gid() == 0 {
            println!("Ping! ...");
            dsm.post_sem("sem_one")?;
            dsm.wait_sem("sem_zero")?;
        } else {
            println!("... Pong!");
            dsm.post_sem("sem_zero")?;
            dsm.wait_sem("sem_one")?;
        }
    }

    // Unblock the peer's last down before leaving.
    dsm.post_sem("sem_one")?;

    dsm.exit()?;
    Ok(())
}
